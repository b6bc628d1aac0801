//! Volume identifier parsing.
//!
//! A volume is addressed as `[pool/]name[#ro]`: the pool falls back to the
//! configured default, and the `#ro` suffix requests a read-only mount.

use lazy_static::lazy_static;
use regex::Regex;
use snafu::{ResultExt, Snafu};

lazy_static! {
    static ref IMAGE_NAME_REGEX: Regex =
        Regex::new(r"^(([-_.[:alnum:]]+)/)?([-_.[:alnum:]]+)(#(ro))?$").unwrap();
}

/// Prefix used when a removed image is renamed instead of deleted.
const BACKUP_PREFIX: &str = "trash";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum NameError {
    #[snafu(display("unable to parse image name: {name}"))]
    Unparseable { name: String },
    #[snafu(display("unable to build backup name pattern for {name}: {source}"))]
    BackupPattern { name: String, source: regex::Error },
}

/// A parsed volume identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    pub pool: String,
    pub image: String,
    pub readonly: bool,
}

impl VolumeName {
    /// Parse `[pool/]name[#ro]`, substituting `default_pool` when the pool
    /// part is absent.
    pub fn parse(fullname: &str, default_pool: &str) -> Result<VolumeName, NameError> {
        let captures = IMAGE_NAME_REGEX
            .captures(fullname)
            .ok_or_else(|| NameError::Unparseable {
                name: fullname.to_string(),
            })?;
        Ok(VolumeName {
            pool: captures
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| default_pool.to_string()),
            image: captures[3].to_string(),
            readonly: captures.get(5).is_some(),
        })
    }

    /// The `pool/name` form used in listings and lock keys.
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.pool, self.image)
    }

    /// Render back to the identifier grammar, including the `#ro` suffix.
    pub fn render(&self) -> String {
        if self.readonly {
            format!("{}/{}#ro", self.pool, self.image)
        } else {
            self.qualified()
        }
    }
}

/// Next free backup name for `name`: `trash_<N>_<name>` where `N` is one
/// past the highest number already taken in `existing`, or 0.
pub fn generate_backup_name(name: &str, existing: &[String]) -> Result<String, NameError> {
    // the name is interpolated verbatim: a `.` in an image name matches any
    // character during the scan
    let pattern = Regex::new(&format!("^{BACKUP_PREFIX}_([0-9]{{1,3}})_{name}$"))
        .context(BackupPatternSnafu { name })?;

    let mut count = 0u32;
    for image in existing {
        if let Some(captures) = pattern.captures(image) {
            if let Ok(number) = captures[1].parse::<u32>() {
                if number >= count {
                    count = number + 1;
                }
            }
        }
    }
    Ok(format!("{BACKUP_PREFIX}_{count}_{name}"))
}
