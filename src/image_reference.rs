use std::convert::Infallible;
use std::fmt;

pub static DEFAULT_TAG: &str = "latest";

/// Which of the optional leading segments were present in the original reference.
/// Re-serialization emits exactly these, so a reference without a host never gains one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceShape {
    /// `repo[:tag]`
    Repo,
    /// `project/repo[:tag]`
    ProjectRepo,
    /// `host/project/repo[:tag]`
    HostProjectRepo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub host: Option<String>,
    pub project: Option<String>,
    pub repo: String,
    pub tag: String,
    /// Whether the tag was spelled out or defaulted to `latest`.
    pub explicit_tag: bool,
    pub shape: ReferenceShape,
}

/// Every string parses at present.
pub type ParseError = Infallible;

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = image.split('/').collect();
        let (host, project, last, shape) = match parts.as_slice() {
            [] => (None, None, image.to_string(), ReferenceShape::Repo),
            [repo] => (None, None, repo.to_string(), ReferenceShape::Repo),
            [project, repo] => (
                None,
                Some(project.to_string()),
                repo.to_string(),
                ReferenceShape::ProjectRepo,
            ),
            // projects are flat, deeper segments belong to the repository
            [host, project, repo @ ..] => (
                Some(host.to_string()),
                Some(project.to_string()),
                repo.join("/"),
                ReferenceShape::HostProjectRepo,
            ),
        };

        let (repo, tag, explicit_tag) = match last.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string(), true),
            _ => (last.clone(), DEFAULT_TAG.to_string(), false),
        };

        Ok(Self {
            host,
            project,
            repo,
            tag,
            explicit_tag,
            shape,
        })
    }

    /// Same reference with another tag; the tag is always spelled out afterwards.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            explicit_tag: true,
            ..self.clone()
        }
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or_default()
    }

    pub fn project(&self) -> &str {
        self.project.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape {
            ReferenceShape::HostProjectRepo => {
                write!(f, "{}/{}/{}", self.host(), self.project(), self.repo)?
            }
            ReferenceShape::ProjectRepo => write!(f, "{}/{}", self.project(), self.repo)?,
            ReferenceShape::Repo => write!(f, "{}", self.repo)?,
        }
        if self.explicit_tag {
            write!(f, ":{}", self.tag)?;
        }
        Ok(())
    }
}
