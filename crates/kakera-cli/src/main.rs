//! kakera: inspect and edit container files from the shell.
//!
//! Usage:
//!   kakera notes.kkr init --block-size 4096
//!   kakera notes.kkr put ./photos /albums
//!   kakera notes.kkr ls -r /
//!   kakera notes.kkr cat /albums/readme.txt
//!   kakera notes.kkr find -e '.*\.jpg'
//!   kakera notes.kkr get ./restored /albums

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use kakera_vfs::{
    AccessMode, Container, ContainerConfig, VfsError, VfsNode, VirtualDirectory,
};

/// Virtual filesystems packed into a single file.
#[derive(Parser, Debug)]
#[command(name = "kakera")]
#[command(about = "Inspect and edit kakera container files")]
struct Args {
    /// Container file (created if missing)
    container: PathBuf,

    /// Block size used when creating a container
    #[arg(long, global = true)]
    block_size: Option<u64>,

    /// RON file with container options
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the container if it does not exist yet
    Init,

    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
    },

    /// Create a directory and any missing parents
    Mkdir { path: String },

    /// Copy a host file or folder into a container directory
    Put {
        source: PathBuf,

        #[arg(default_value = "/")]
        dest: String,
    },

    /// Copy a container directory out to a host folder
    Get {
        dest: PathBuf,

        #[arg(default_value = "/")]
        path: String,
    },

    /// Print a file's content
    Cat { path: String },

    /// Remove a file or a directory with everything below it
    Rm { path: String },

    /// Search file names anywhere in the container
    Find {
        needle: String,

        /// Treat the needle as a regular expression over the whole name
        #[arg(short = 'e', long)]
        regex: bool,
    },

    /// Show block usage
    Stat,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    let container = Container::open_with(&args.container, &config)
        .with_context(|| format!("opening {}", args.container.display()))?;

    run(&container, args.command)?;
    container.close().context("closing container")?;
    Ok(())
}

fn load_config(args: &Args) -> Result<ContainerConfig> {
    let mut config = match &args.config {
        Some(path) => ContainerConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => ContainerConfig::default(),
    };
    if let Some(block_size) = args.block_size {
        config = config.with_block_size(block_size);
    }
    Ok(config)
}

fn run(container: &Container, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            let stats = container.stats()?;
            println!(
                "{} ready, block size {}",
                container.path().display(),
                stats.block_size
            );
        }
        Command::Ls { path, recursive } => {
            let dir = container.directory_at(&path)?;
            list(&dir, recursive)?;
        }
        Command::Mkdir { path } => {
            let mut dir = container.root().clone();
            for part in path.split('/').filter(|part| !part.is_empty()) {
                dir = match dir.directory(part) {
                    Ok(existing) => existing,
                    Err(VfsError::NotFound(_)) => dir.mkdir(part)?,
                    Err(e) => return Err(e.into()),
                };
            }
        }
        Command::Put { source, dest } => {
            let dir = container.directory_at(&dest)?;
            put(&dir, &source)?;
        }
        Command::Get { dest, path } => {
            let dir = container.directory_at(&path)?;
            dir.export_folder(&dest)
                .with_context(|| format!("exporting {path} to {}", dest.display()))?;
        }
        Command::Cat { path } => {
            let file = container.file_at(&path)?;
            let mut handle = file.open(AccessMode::ReadOnly)?;
            let data = handle.read_to_end()?;
            handle.close()?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Rm { path } => match container.file_at(&path) {
            Ok(file) => file.remove()?,
            Err(VfsError::NotFound(_)) => container.directory_at(&path)?.remove()?,
            Err(e) => return Err(e.into()),
        },
        Command::Find { needle, regex } => {
            let matches = if regex {
                container.find_pattern(&needle)?
            } else {
                container.find_name(&needle)?
            };
            for file in matches {
                println!("{}", file?.path());
            }
        }
        Command::Stat => {
            let stats = container.stats()?;
            println!("block size  {}", stats.block_size);
            println!("blocks      {}", stats.blocks);
            println!("free        {}", stats.free_blocks);
            println!("file bytes  {}", stats.file_len);
        }
    }
    Ok(())
}

fn put(dir: &VirtualDirectory, source: &Path) -> Result<()> {
    if source.is_dir() {
        dir.import_folder(source)
            .with_context(|| format!("importing {}", source.display()))?;
    } else if source.is_file() {
        dir.import_file(source)
            .with_context(|| format!("importing {}", source.display()))?;
    } else {
        bail!("{} is neither a file nor a folder", source.display());
    }
    Ok(())
}

fn list(dir: &VirtualDirectory, recursive: bool) -> Result<()> {
    for child in dir.directories()? {
        println!("{}/", if recursive { child.path() } else { child.name() });
        if recursive {
            list(&child, true)?;
        }
    }
    for file in dir.files()? {
        let name = if recursive { file.path() } else { file.name() };
        println!("{:>10}  {}", file.len()?, name);
    }
    Ok(())
}
