use clap::Parser;
use splitproc::images::{self, ImageDir};
use splitproc::loopback::Loopback;
use splitproc::options::{self, Options};
use splitproc::{HandleTable, Runtime};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "splitproc")]
#[command(about = "inspect and replay split-process checkpoint state", long_about = None)]
struct Args {
    /// Path to the checkpoint image directory
    #[arg(short = 'D', long, value_name = "DIR")]
    image_dir: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Restore into a loopback library and show the rebinding
    #[arg(long)]
    replay: bool,

    /// World size of the loopback library
    #[arg(long, default_value_t = 1)]
    world_size: i32,

    /// Rank of this process in the loopback world
    #[arg(long, default_value_t = 0)]
    rank: i32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    splitproc::logging::init(args.verbose);
    options::opts_init(Options::from_env())
        .map_err(|_| anyhow::anyhow!("options were already initialized"))?;
    log::debug!("Options: {:?}", options::opts());

    log::info!("Image directory: {}", args.image_dir.display());

    let img_dir = ImageDir::open(&args.image_dir)?;
    let state = img_dir.read_state()?;
    images::state::display(&state);

    if !args.replay {
        return Ok(());
    }

    if args.rank < 0 || args.rank >= args.world_size {
        anyhow::bail!("rank {} is outside a world of {}", args.rank, args.world_size);
    }

    let rt = Runtime::in_memory(
        options::opts().clone(),
        Box::new(Loopback::new(args.world_size, args.rank)),
    )?;
    let stats = rt.restore(&args.image_dir)?;
    log::info!(
        "Replay: {} records in {} passes, {} handles rebound",
        stats.records,
        stats.passes,
        stats.rebound
    );

    for (handle, binding) in rt.table().entries() {
        if HandleTable::is_predefined(handle) {
            continue;
        }
        match binding.real {
            Some(real) => log::info!("  {} -> {} ({:?})", handle, real, binding.state),
            None => log::info!("  {} unbound ({:?})", handle, binding.state),
        }
    }

    Ok(())
}
