mod model_source;
mod progress;
mod tokens;

pub use model_source::*;
pub use progress::{IterWithProgress, NiceProgressBar};
pub use tokens::{get_token, ParseTokenSourceError, TokenSource, DEFAULT_TOKEN_VAR};
