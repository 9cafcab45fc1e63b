use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Primary environment variable holding the synthesis API key.
pub const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";
/// Name used by older tooling; consulted after [`API_KEY_ENV`].
pub const LEGACY_API_KEY_ENV: &str = "XI_API_KEY";

pub fn env_value_nonempty(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

/// Reads `key` from a dotenv-style file. Accepts `export` prefixes and quoted values.
pub fn read_env_value(path: &Path, key: &str) -> Result<Option<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read env file: {}", path.display()))?;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim();
        let name = name.strip_prefix("export ").unwrap_or(name).trim();
        if name != key {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if value.is_empty() {
            return Ok(None);
        }
        return Ok(Some(value.to_string()));
    }

    Ok(None)
}

fn env_file_candidates(base_dir: &Path, env_name: Option<&str>) -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(2);
    if let Some(env_name) = env_name.filter(|name| !name.trim().is_empty()) {
        candidates.push(base_dir.join(format!(".env.{env_name}")));
    }
    candidates.push(base_dir.join(".env"));
    candidates
}

pub fn load_api_key_from_env_files(base_dir: &Path, env_name: Option<&str>) -> Result<Option<String>> {
    for path in env_file_candidates(base_dir, env_name) {
        if !path.exists() {
            continue;
        }
        for key in [API_KEY_ENV, LEGACY_API_KEY_ENV] {
            if let Some(value) = read_env_value(&path, key)? {
                tracing::debug!(file = %path.display(), key, "api key loaded from env file");
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

/// Resolves the API key: explicit value, then environment, then env files.
pub struct ApiKeyResolver<'a> {
    pub key: Option<&'a str>,
    pub env_name: Option<&'a str>,
}

impl Default for ApiKeyResolver<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ApiKeyResolver<'a> {
    pub fn new() -> Self {
        Self {
            key: None,
            env_name: None,
        }
    }

    pub fn with_key(mut self, key: Option<&'a str>) -> Self {
        self.key = key;
        self
    }

    pub fn with_env(mut self, env_name: Option<&'a str>) -> Self {
        self.env_name = env_name;
        self
    }

    pub fn resolve(&self) -> Result<Option<String>> {
        if let Some(key) = self.key
            && !key.trim().is_empty()
        {
            return Ok(Some(key.trim().to_string()));
        }

        for var in [API_KEY_ENV, LEGACY_API_KEY_ENV] {
            if let Some(key) = env_value_nonempty(var) {
                return Ok(Some(key));
            }
        }

        let base_dir = std::env::current_dir()?;
        load_api_key_from_env_files(&base_dir, self.env_name)
    }

    pub fn require(&self) -> Result<String> {
        self.resolve()?.with_context(|| {
            format!("--api-key, {API_KEY_ENV}, or a .env file defining {API_KEY_ENV} is required")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "speechstream-auth-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn reads_quoted_and_exported_values() {
        let dir = scratch_dir("quoted");
        let path = dir.join(".env");
        std::fs::write(
            &path,
            "# comment\nOTHER=1\nexport ELEVENLABS_API_KEY=\"abc123\"\n",
        )
        .unwrap();

        let value = read_env_value(&path, API_KEY_ENV).unwrap();
        assert_eq!(value.as_deref(), Some("abc123"));
        assert_eq!(read_env_value(&path, "MISSING").unwrap(), None);
    }

    #[test]
    fn named_env_file_wins_over_plain_env() {
        let dir = scratch_dir("named");
        std::fs::write(dir.join(".env"), "XI_API_KEY=plain\n").unwrap();
        std::fs::write(dir.join(".env.staging"), "ELEVENLABS_API_KEY=staging\n").unwrap();

        let key = load_api_key_from_env_files(&dir, Some("staging")).unwrap();
        assert_eq!(key.as_deref(), Some("staging"));

        let key = load_api_key_from_env_files(&dir, None).unwrap();
        assert_eq!(key.as_deref(), Some("plain"));
    }

    #[test]
    fn explicit_key_short_circuits() {
        let resolver = ApiKeyResolver::new().with_key(Some("  explicit "));
        assert_eq!(resolver.resolve().unwrap().as_deref(), Some("explicit"));
    }
}
