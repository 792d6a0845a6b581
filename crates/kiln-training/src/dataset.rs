use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Implicit category holding defect-free images. Always part of the label set.
pub const OK_CATEGORY: &str = "OK";

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

/// The directories that hold images for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDirs {
    pub category: String,
    pub dirs: Vec<PathBuf>,
}

/// Label set used for training and the confusion sweep: the configured
/// categories in order, then `OK` unless already present.
#[must_use]
pub fn label_set(categories: &[String]) -> Vec<String> {
    let mut labels: Vec<String> = Vec::with_capacity(categories.len() + 1);
    for category in categories {
        let category = category.trim();
        if !category.is_empty() && !labels.iter().any(|l| l == category) {
            labels.push(category.to_string());
        }
    }
    if !labels.iter().any(|l| l.eq_ignore_ascii_case(OK_CATEGORY)) {
        labels.push(OK_CATEGORY.to_string());
    }
    labels
}

/// Resolve every category in the label set to the existing directories under
/// `roots`. For each root both `<root>/<process>/<category>` and
/// `<root>/<category>` are considered. Categories with no directory are left out.
#[must_use]
pub fn resolve_category_dirs(roots: &[PathBuf], process_names: &[String], categories: &[String]) -> Vec<CategoryDirs> {
    let mut resolved = Vec::new();
    for category in label_set(categories) {
        let mut dirs = Vec::new();
        for root in roots {
            let mut candidates: Vec<PathBuf> =
                process_names.iter().map(|process| root.join(process).join(&category)).collect();
            candidates.push(root.join(&category));
            for candidate in candidates {
                if candidate.is_dir() && !dirs.contains(&candidate) {
                    dirs.push(candidate);
                }
            }
        }
        if dirs.is_empty() {
            debug!(category = %category, "No image directory found for category");
            continue;
        }
        resolved.push(CategoryDirs { category, dirs });
    }
    resolved
}

#[must_use]
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
}

/// Count image files below `dir`. Unreadable entries are logged and skipped.
#[must_use]
pub fn count_images(dir: &Path) -> usize {
    let mut count = 0;
    for entry in WalkDir::new(dir).follow_links(true) {
        match entry {
            Ok(entry) if entry.file_type().is_file() && is_image(entry.path()) => count += 1,
            Ok(_) => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry while counting images"),
        }
    }
    count
}
