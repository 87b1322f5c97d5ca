use convergefs::config::Config;
use convergefs::error::{ConvergeError, Result};
use convergefs::vfs::ConvergenceFs;

pub fn print_resolution(config: &Config, virtual_path: &str) -> Result<()> {
    let options = config.to_mount_options()?.with_async_io(false);
    let union_fs = ConvergenceFs::mount(options)?;

    let resolved = union_fs.resolve(virtual_path);
    union_fs.unmount()?;

    let (physical, root) = resolved.map_err(|status| {
        ConvergeError::Config(format!("Cannot resolve '{}': {}", virtual_path, status))
    })?;
    println!("{}", physical.display());
    println!("root: {}", root.index());
    Ok(())
}
