//! Validation functions for configuration values.
//!
//! Provides custom validation functions for source paths, the destination
//! directory, archive name prefixes and cron expressions.

use chrono::Utc;
use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

pub fn validate_valid_archive_base_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() {
        return Err(ValidationError::new("InvalidArchiveBaseName")
            .with_message("archive_name must not be empty".into()));
    }

    if !is_sanitized(name) {
        return Err(ValidationError::new("InvalidArchiveBaseName").with_message(
            format!("Invalid file name, try sanitizing like {:?}", sanitize(name)).into(),
        ));
    }

    if name.len() > 100 {
        return Err(ValidationError::new("InvalidArchiveBaseName")
            .with_message("Invalid archive_name, maximum len is 100".into()));
    }

    Ok(())
}

pub fn validate_path_exist<P: AsRef<Path>>(path: P) -> Result<(), ValidationError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ValidationError::new("SourceNotFound")
            .with_message(format!("{:?} not found", path).into()));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access destination {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}

pub fn validate_cron_str<S: AsRef<str>>(cron: S) -> Result<(), ValidationError> {
    let cron = cron.as_ref();
    if cron_parser::parse(cron, &Utc::now()).is_err() {
        return Err(ValidationError::new("InvalidCron")
            .with_message(format!("Invalid cron string: {cron:?}").into()));
    }

    Ok(())
}
