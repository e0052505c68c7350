use anyhow::Result;
use std::path::Path;

pub fn check_store_dir(dir: &str) -> Result<()> {
    let p = Path::new(dir);
    if p.exists() {
        anyhow::ensure!(p.is_dir(), "store.dir is not a dir: {}", dir);
        let md = std::fs::metadata(p)?;
        anyhow::ensure!(!md.permissions().readonly(), "store.dir is read-only: {}", dir);
    } else {
        // Must be creatable; probe the parent.
        let parent = p.parent().unwrap_or_else(|| Path::new("."));
        anyhow::ensure!(
            parent.exists(),
            "store.dir parent missing: {}",
            parent.display()
        );
    }
    Ok(())
}
