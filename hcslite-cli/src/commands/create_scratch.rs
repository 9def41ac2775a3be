use std::path::PathBuf;

use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct CreateScratchArgs {
    /// Where the formatted VHD is written
    #[arg(long)]
    pub destpath: PathBuf,

    /// Requested size in GiB
    #[arg(long = "sizeGB", default_value_t = hcslite::uvm::DEFAULT_SCRATCH_SIZE_GB)]
    pub size_gb: u64,

    /// Cache file reused (and seeded) for default-sized requests
    #[arg(long)]
    pub cache_path: Option<PathBuf>,
}

pub async fn execute(args: CreateScratchArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    runtime
        .create_scratch(&args.destpath, args.size_gb, args.cache_path.as_ref())
        .await?;
    Ok(0)
}
