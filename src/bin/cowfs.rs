//! Binary entry point for the cowfs image tool.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cowfs::{
    disk::probe,
    primitives::io::{FileDevice, FileIo},
    Filesystem, FsError, FsOptions, RootId,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cowfs",
    version,
    about = "Create and inspect cowfs images",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Format a new image.
    Mkfs {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        #[arg(long, value_name = "BYTES", help = "Size of the image to create")]
        size: u64,

        #[arg(long, value_name = "FILE", help = "TOML file with format options")]
        config: Option<PathBuf>,

        #[arg(
            long,
            value_name = "N",
            default_value_t = 0,
            help = "Commit N extra generations, each adding a data extent and a tree block"
        )]
        populate: u64,
    },
    /// Print the newest valid superblock of an image.
    DumpSuper {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err} (errno {})", err.errno());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), FsError> {
    match cli.command {
        Command::Mkfs {
            image,
            size,
            config,
            populate,
        } => {
            let options = match config {
                Some(path) => FsOptions::load(path)?,
                None => FsOptions::default(),
            };
            let device: Arc<dyn FileIo> = Arc::new(FileDevice::create(&image, size)?);
            let mut fs = Filesystem::format(device, options)?;
            for n in 0..populate {
                populate_generation(&mut fs, n)?;
            }
            println!(
                "formatted {}: fsid {} generation {}",
                image.display(),
                hex::encode(fs.fsid().to_be_bytes()),
                fs.generation()
            );
        }
        Command::DumpSuper { image } => {
            let device = FileDevice::open(&image)?;
            let found = probe(&device)?;
            let sb = found.super_block;
            println!("fsid                  {}", hex::encode(sb.fsid.to_be_bytes()));
            println!("generation            {}", sb.generation);
            println!("bytenr                {}", sb.bytenr);
            println!("root                  {} (level {})", sb.root, sb.root_level);
            println!(
                "chunk_root            {} (level {}, generation {})",
                sb.chunk_root, sb.chunk_root_level, sb.chunk_root_generation
            );
            println!("total_bytes           {}", sb.total_bytes);
            println!("bytes_used            {}", sb.bytes_used);
            println!("chunk_cursor          {}", sb.chunk_cursor);
            println!("nodesize              {}", sb.nodesize);
            println!("sectorsize            {}", sb.sectorsize);
            println!("num_mirrors           {}", sb.num_mirrors);
        }
    }
    Ok(())
}

/// Commits one generation that copies the default subvolume root and hangs
/// a data extent and a child block off it.
fn populate_generation(fs: &mut Filesystem, n: u64) -> Result<(), FsError> {
    let mut trans = fs.start_transaction(2)?;
    let leaf = trans.cow_tree_root(RootId::FS_TREE)?;
    let sectorsize = u64::from(trans.fs().options().sectorsize);
    trans.alloc_data_extent(leaf, RootId::FS_TREE, 256 + n, 0, 16 * sectorsize)?;
    trans.alloc_tree_block(RootId::FS_TREE, 0, Some(leaf))?;
    let generation = trans.commit()?;
    info!(generation, "cowfs.populate");
    Ok(())
}
