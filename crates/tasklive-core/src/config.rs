use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::time::Duration;

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

pub const DEFAULT_API_URL: &str =
  "http://localhost:5000/api";
pub const DEFAULT_SOCKET_URL: &str =
  "ws://localhost:5000/ws";

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Config {
  pub fn defaults() -> Self {
    let mut cfg = Config {
      map:          HashMap::new(),
      loaded_files: vec![]
    };

    cfg.map.insert(
      "api.url".to_string(),
      DEFAULT_API_URL.to_string()
    );
    cfg.map.insert(
      "socket.url".to_string(),
      DEFAULT_SOCKET_URL.to_string()
    );
    cfg.map.insert(
      "request.timeout_ms".to_string(),
      "10000".to_string()
    );
    cfg.map.insert(
      "socket.reconnect_ms".to_string(),
      "2000".to_string()
    );

    cfg
  }

  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::defaults();

    let rc = resolve_rc_path(
      rc_override
    )?;
    if let Some(path) = rc {
      info!(rc = %path.display(), "loading rc file");
      cfg.load_file(&path)?;
    } else {
      warn!(
        "no rc file found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_u64(
    &self,
    key: &str
  ) -> anyhow::Result<Option<u64>> {
    self
      .map
      .get(key)
      .map(|raw| {
        raw.trim().parse::<u64>().with_context(
          || {
            format!(
              "config key {key} expects \
               a number, got {raw:?}"
            )
          }
        )
      })
      .transpose()
  }

  pub fn api_url(&self) -> String {
    self
      .get("api.url")
      .unwrap_or_else(|| {
        DEFAULT_API_URL.to_string()
      })
  }

  pub fn socket_url(&self) -> String {
    self
      .get("socket.url")
      .unwrap_or_else(|| {
        DEFAULT_SOCKET_URL.to_string()
      })
  }

  pub fn request_timeout(
    &self
  ) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(
      self
        .get_u64("request.timeout_ms")?
        .unwrap_or(10_000)
    ))
  }

  pub fn reconnect_delay(
    &self
  ) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(
      self
        .get_u64("socket.reconnect_ms")?
        .unwrap_or(2_000)
    ))
  }

  pub fn identity_name(
    &self
  ) -> Option<String> {
    self.get("identity.name")
  }

  pub fn identity_color(
    &self
  ) -> Option<String> {
    self.get("identity.color")
  }

  pub fn identity_file(
    &self
  ) -> anyhow::Result<PathBuf> {
    if let Some(raw) =
      self.get("identity.file")
    {
      return Ok(expand_tilde(
        Path::new(&raw)
      ));
    }

    let base = dirs::config_dir()
      .ok_or_else(|| {
        anyhow!(
          "cannot determine config \
           directory"
        )
      })?;
    Ok(
      base
        .join("tasklive")
        .join("identity.toml")
    )
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let line =
        strip_comment(raw_line.trim());
      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var("TASKLIVERC")
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    return Ok(None);
  };
  let candidate =
    home.join(".taskliverc");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

/// Drops `# ...` comments. A `#` glued to a value (`#ec4899`) is kept.
fn strip_comment(line: &str) -> &str {
  if line.starts_with('#') {
    return "";
  }
  let bytes = line.as_bytes();
  for (idx, _) in line.match_indices('#')
  {
    let spaced_before = idx > 0
      && bytes[idx - 1]
        .is_ascii_whitespace();
    let spaced_after = bytes
      .get(idx + 1)
      .is_none_or(|b| {
        b.is_ascii_whitespace()
      });
    if spaced_before && spaced_after {
      return line[..idx].trim();
    }
  }
  line
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}
