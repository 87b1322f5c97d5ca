use chrono::{DateTime, Utc};

use convergefs::config::Config;
use convergefs::error::Result;
use convergefs::vfs::ConvergenceFs;

pub fn print_tree(config: &Config, json: bool) -> Result<()> {
    // Listing never issues transfers, so the workers stay off.
    let options = config.to_mount_options()?.with_async_io(false);
    let union_fs = ConvergenceFs::mount(options)?;
    let folders = union_fs.folders();
    let entries = union_fs.listing();

    if json {
        let roots: Vec<_> = folders
            .priority_order()
            .map(|root| {
                serde_json::json!({
                    "index": root.index(),
                    "path": folders.root_path(root).display().to_string(),
                    "writable": root.is_write_target(),
                })
            })
            .collect();
        let nodes: Vec<_> = entries
            .iter()
            .map(|entry| {
                let modified: DateTime<Utc> = entry.attrs.last_write_time.into();
                serde_json::json!({
                    "path": entry.path,
                    "root": entry.root.index(),
                    "directory": entry.attrs.is_directory,
                    "size": entry.attrs.size,
                    "modified": modified.to_rfc3339(),
                })
            })
            .collect();

        println!(
            "{}",
            serde_json::to_string(&serde_json::json!({
                "node_count": union_fs.node_count(),
                "roots": roots,
                "nodes": nodes,
            }))?
        );
    } else {
        println!(
            "Union of {} roots ({} nodes)",
            folders.len(),
            union_fs.node_count()
        );
        for root in folders.priority_order() {
            let label = if root.is_write_target() { " (write target)" } else { "" };
            println!("  [{}] {}{}", root.index(), folders.root_path(root).display(), label);
        }
        println!();
        for entry in &entries {
            let suffix = if entry.attrs.is_directory { "/" } else { "" };
            println!("{}{}\t[{}]", entry.path, suffix, entry.root.index());
        }
    }

    union_fs.unmount()?;
    Ok(())
}
