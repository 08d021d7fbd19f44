//! Test providers
//!
//! Produce the ordered list of test identifiers the leader enqueues.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::TestsConfig;

/// Provider errors
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("failed to walk test directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("path {0} is outside the test root")]
    OutsideRoot(PathBuf),
}

pub trait TestProvider {
    fn tests(&self) -> Result<Vec<String>, ProviderError>;
}

/// Fixed list of identifiers
#[derive(Debug, Clone)]
pub struct StaticTestProvider {
    tests: Vec<String>,
}

impl StaticTestProvider {
    pub fn new(tests: Vec<String>) -> Self {
        Self { tests }
    }
}

impl TestProvider for StaticTestProvider {
    fn tests(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.tests.clone())
    }
}

/// Files under a root matching include globs and no exclude glob.
///
/// Identifiers are paths relative to the root with `/` separators, in
/// directory walk order sorted by file name.
#[derive(Debug)]
pub struct GlobTestProvider {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl GlobTestProvider {
    pub fn new(root: impl Into<PathBuf>, include: &[String], exclude: &[String]) -> Result<Self, ProviderError> {
        Ok(Self {
            root: root.into(),
            include: build_set(include)?,
            exclude: build_set(exclude)?,
        })
    }

    fn identifier(&self, path: &Path) -> Result<String, ProviderError> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| ProviderError::OutsideRoot(path.to_path_buf()))?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }
}

impl TestProvider for GlobTestProvider {
    fn tests(&self) -> Result<Vec<String>, ProviderError> {
        let mut tests = Vec::new();

        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let identifier = self.identifier(entry.path())?;
            if self.include.is_match(&identifier) && !self.exclude.is_match(&identifier) {
                tests.push(identifier);
            }
        }

        Ok(tests)
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns.iter().filter(|p| !p.is_empty()) {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

/// Provider selected by the `[tests]` section: the explicit list when given,
/// globs otherwise.
pub fn provider_for(config: &TestsConfig) -> Result<Box<dyn TestProvider>, ProviderError> {
    if !config.list.is_empty() {
        return Ok(Box::new(StaticTestProvider::new(config.list.clone())));
    }
    Ok(Box::new(GlobTestProvider::new(
        config.root.clone(),
        &config.include,
        &config.exclude,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_glob_provider_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "spec/models/user_spec.rb");
        touch(dir.path(), "spec/models/account_spec.rb");
        touch(dir.path(), "spec/support/helpers.rb");
        touch(dir.path(), "spec/slow/big_spec.rb");
        touch(dir.path(), "lib/thing.rb");

        let provider = GlobTestProvider::new(
            dir.path(),
            &["spec/**/*_spec.rb".to_string()],
            &["spec/slow/**".to_string()],
        )
        .unwrap();

        assert_eq!(
            provider.tests().unwrap(),
            vec!["spec/models/account_spec.rb", "spec/models/user_spec.rb"]
        );
    }

    #[test]
    fn test_invalid_glob() {
        let result = GlobTestProvider::new(".", &["spec/[".to_string()], &[]);
        assert!(matches!(result, Err(ProviderError::Glob(_))));
    }

    #[test]
    fn test_missing_root_is_error() {
        let provider = GlobTestProvider::new("/nonexistent/tests", &["**/*".to_string()], &[]).unwrap();
        assert!(matches!(provider.tests(), Err(ProviderError::Walk(_))));
    }

    #[test]
    fn test_list_wins_over_globs() {
        let config = TestsConfig {
            list: vec!["features/login.feature:12".to_string()],
            ..TestsConfig::default()
        };
        let provider = provider_for(&config).unwrap();
        assert_eq!(provider.tests().unwrap(), vec!["features/login.feature:12"]);
    }
}
