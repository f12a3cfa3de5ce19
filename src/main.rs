mod attrs;
mod error;
mod fs;
mod registry;
mod stats;
mod sys;

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use fuser::MountOption;

use fs::PassthroughFs;

fn main() {
    let matches = Command::new("passthru-fuse")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Mounts a passthrough view of SOURCE at MOUNTPOINT")
        .arg(
            Arg::new("SOURCE")
                .required(true)
                .index(1)
                .help("Directory whose contents are re-exposed through the mount"),
        )
        .arg(
            Arg::new("MOUNTPOINT")
                .required(true)
                .index(2)
                .help("Empty directory to mount the passthrough filesystem at"),
        )
        .arg(
            Arg::new("auto_unmount")
                .long("auto-unmount")
                .action(ArgAction::SetTrue)
                .help("Automatically unmount on process exit"),
        )
        .arg(
            Arg::new("allow-root")
                .long("allow-root")
                .action(ArgAction::SetTrue)
                .help("Allow root user to access the filesystem"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase log verbosity (-v for debug, -vv for trace)"),
        )
        .get_matches();

    let verbosity = matches.get_count("verbose");
    let default_filter = match verbosity {
        0 => "info",
        1 => "passthru_fuse=debug,info",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let source = PathBuf::from(matches.get_one::<String>("SOURCE").unwrap());
    let mountpoint = PathBuf::from(matches.get_one::<String>("MOUNTPOINT").unwrap());

    let source = match source.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            log::error!("source {:?} is not accessible: {}", source, e);
            std::process::exit(1);
        }
    };
    let mountpoint = match mountpoint.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            log::error!("mount point {:?} is not accessible: {}", mountpoint, e);
            std::process::exit(1);
        }
    };

    let source_meta = match std::fs::metadata(&source) {
        Ok(m) => m,
        Err(e) => {
            log::error!("cannot stat source {:?}: {}", source, e);
            std::process::exit(1);
        }
    };
    let mount_meta = match std::fs::metadata(&mountpoint) {
        Ok(m) => m,
        Err(e) => {
            log::error!("cannot stat mount point {:?}: {}", mountpoint, e);
            std::process::exit(1);
        }
    };
    // Informational only: the design permits but does not enforce
    // cross-device rejection.
    if source_meta.dev() != mount_meta.dev() {
        log::warn!(
            "source {:?} (dev {}) and mount point {:?} (dev {}) are on different devices",
            source,
            source_meta.dev(),
            mountpoint,
            mount_meta.dev()
        );
    }

    let mut options = vec![MountOption::RW, MountOption::FSName("passthru_fuse".to_string())];
    if matches.get_flag("auto_unmount") {
        options.push(MountOption::AutoUnmount);
    }
    if matches.get_flag("allow-root") {
        options.push(MountOption::AllowRoot);
    }

    let filesystem = PassthroughFs::new(source, mountpoint.clone());

    log::info!("mounting passthrough filesystem at {:?}", mountpoint);
    match fuser::mount2(filesystem, &mountpoint, &options) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            log::error!("mount failed: {}", e);
            std::process::exit(1);
        }
    }
}
