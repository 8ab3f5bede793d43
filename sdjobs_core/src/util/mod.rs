mod auto_dtype;

pub use auto_dtype::{ModelDType, TryIntoDType};
