use std::{
    ffi::OsStr,
    fmt::{Debug, Display},
    fs,
    path::{Path, PathBuf},
};

use crate::{get_token, TokenSource};
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};

/// Source from which to load the model. This is easiest to create with [`ModelSource::from_model_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    ModelId(String),
    Local(PathBuf),
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelId(model_id) => write!(f, "model id: {model_id}"),
            Self::Local(path) => write!(f, "local path: {}", path.display()),
        }
    }
}

impl ModelSource {
    /// Load the model from a Hugging Face model ID or a local path.
    ///
    /// An existing directory always wins over a Hugging Face model ID of the same name.
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        let model_id = model_id.to_string();
        let path = PathBuf::from(&model_id);
        if path.is_dir() {
            Self::Local(path)
        } else {
            Self::ModelId(model_id)
        }
    }
}

pub enum FileLoader {
    Api(Box<ApiRepo>),
    Local(PathBuf),
}

impl FileLoader {
    pub fn from_model_source(
        source: &ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
    ) -> anyhow::Result<Self> {
        match source {
            ModelSource::ModelId(model_id) => {
                let api_builder = ApiBuilder::new()
                    .with_progress(!silent)
                    .with_token(get_token(&token)?)
                    .build()?;
                let revision = revision.unwrap_or("main".to_string());
                let api = api_builder.repo(Repo::with_revision(
                    model_id.clone(),
                    RepoType::Model,
                    revision,
                ));

                Ok(Self::Api(Box::new(api)))
            }
            ModelSource::Local(path) => {
                if !path.is_dir() {
                    anyhow::bail!("Model path `{}` is not a directory.", path.display());
                }
                Ok(Self::Local(path.clone()))
            }
        }
    }

    /// List all files in the model, relative to its root and `/` separated.
    pub fn list_files(&self) -> anyhow::Result<Vec<String>> {
        match self {
            Self::Api(api) => api
                .info()
                .map(|repo| {
                    repo.siblings
                        .iter()
                        .map(|x| x.rfilename.clone())
                        .collect::<Vec<String>>()
                })
                .map_err(|e| anyhow::Error::msg(e.to_string())),
            Self::Local(root) => {
                let mut files = Vec::new();
                walk_dir(root, root, &mut files)?;
                files.sort();
                Ok(files)
            }
        }
    }

    /// Resolve a file. Hub files are downloaded to the local cache first.
    pub fn read_file(&self, name: &str) -> anyhow::Result<FileData> {
        match self {
            Self::Api(api) => Ok(FileData::Path(
                api.get(name)
                    .map_err(|e| anyhow::Error::msg(e.to_string()))?,
            )),
            Self::Local(root) => {
                let path = root.join(name);
                if !path.is_file() {
                    anyhow::bail!("File `{name}` not found in `{}`.", root.display());
                }
                Ok(FileData::Path(path))
            }
        }
    }
}

fn walk_dir(root: &Path, dir: &Path, files: &mut Vec<String>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_dir(root, &path, files)?;
        } else {
            let relative = path.strip_prefix(root)?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(name);
        }
    }
    Ok(())
}

pub enum FileData {
    Path(PathBuf),
}

impl Debug for FileData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(p) => write!(f, "path: {}", p.display()),
        }
    }
}

impl FileData {
    pub fn read_to_string(&self) -> anyhow::Result<String> {
        match self {
            Self::Path(p) => Ok(fs::read_to_string(p)?),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Path(p) => p,
        }
    }

    pub fn extension(&self) -> Option<&OsStr> {
        match self {
            Self::Path(p) => p.extension(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{FileLoader, ModelSource};
    use crate::TokenSource;

    fn diffusers_dir() -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("model_index.json"), "{}")?;
        fs::create_dir_all(dir.path().join("unet"))?;
        fs::write(dir.path().join("unet").join("config.json"), "{}")?;
        fs::create_dir_all(dir.path().join("tokenizer"))?;
        fs::write(dir.path().join("tokenizer").join("vocab.json"), "{}")?;
        Ok(dir)
    }

    #[test]
    fn existing_directory_is_local() -> anyhow::Result<()> {
        let dir = diffusers_dir()?;
        let source = ModelSource::from_model_id(dir.path().display());
        assert_eq!(source, ModelSource::Local(dir.path().to_path_buf()));
        assert!(source.to_string().starts_with("local path: "));

        let source = ModelSource::from_model_id("runwayml/stable-diffusion-v1-5");
        assert_eq!(
            source,
            ModelSource::ModelId("runwayml/stable-diffusion-v1-5".to_string())
        );
        assert_eq!(
            source.to_string(),
            "model id: runwayml/stable-diffusion-v1-5"
        );
        Ok(())
    }

    #[test]
    fn local_listing_is_relative_and_sorted() -> anyhow::Result<()> {
        let dir = diffusers_dir()?;
        let source = ModelSource::from_model_id(dir.path().display());
        let loader = FileLoader::from_model_source(&source, true, TokenSource::None, None)?;
        assert_eq!(
            loader.list_files()?,
            vec![
                "model_index.json".to_string(),
                "tokenizer/vocab.json".to_string(),
                "unet/config.json".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn local_read_file() -> anyhow::Result<()> {
        let dir = diffusers_dir()?;
        let source = ModelSource::Local(dir.path().to_path_buf());
        let loader = FileLoader::from_model_source(&source, true, TokenSource::None, None)?;

        let data = loader.read_file("unet/config.json")?;
        assert_eq!(data.read_to_string()?, "{}");
        assert_eq!(data.extension().and_then(|e| e.to_str()), Some("json"));
        assert!(loader.read_file("vae/config.json").is_err());
        Ok(())
    }

    #[test]
    fn missing_local_directory_errors() {
        let source = ModelSource::Local("/no/such/model/dir".into());
        assert!(FileLoader::from_model_source(&source, true, TokenSource::None, None).is_err());
    }
}
