use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use jcommit_core::JournalConfig;
use jcommit_journal::recovery::scan_log;
use jcommit_journal::{BlockDevice, FileDevice, Journal, JournalSuperblock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "jcommit")]
#[command(about = "Write-ahead journal maintenance tool", long_about = None)]
struct Cli {
    /// JSON journal configuration; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log image
    #[arg(long, global = true, default_value = "journal.img")]
    log: PathBuf,
    /// Filesystem image
    #[arg(long, global = true, default_value = "fs.img")]
    fs: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the log and filesystem images and format the log
    Format {
        /// Filesystem image size in blocks
        #[arg(long, default_value_t = 4096)]
        fs_blocks: u64,
    },
    /// Fill filesystem blocks with a pattern in one transaction and commit it
    Commit {
        /// Block to write (repeatable)
        #[arg(short, long = "block", required = true)]
        blocks: Vec<u64>,
        /// Hex byte pattern repeated across each block
        #[arg(short, long, default_value = "a5")]
        pattern: String,
        /// Leave the transaction in the log instead of checkpointing it
        #[arg(long)]
        no_checkpoint: bool,
    },
    /// Show the log superblock and the committed transactions in the log
    Dump {
        /// Also print the first bytes of every logged block
        #[arg(short, long)]
        verbose: bool,
    },
    /// Replay committed transactions into the filesystem image
    Recover,
    /// Write checkpointed blocks home and empty the log
    Checkpoint,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    // the journal blocks on device I/O; keep it off the async workers
    tokio::task::spawn_blocking(move || run(cli)).await?
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => JournalConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => JournalConfig::default(),
    };

    match cli.command {
        Commands::Format { fs_blocks } => {
            let log = FileDevice::create(&cli.log, config.block_size, config.log_blocks)?;
            let fs = FileDevice::create(&cli.fs, config.block_size, fs_blocks)?;
            let journal = Journal::create(config, Arc::new(log), Arc::new(fs))?;
            let sb = journal.superblock();
            println!("Formatted {}", cli.log.display());
            println!("  UUID: {}", hex::encode(sb.uuid));
            println!("  Block size: {}", sb.block_size);
            println!("  Log blocks: {} (first {})", sb.maxlen, sb.first);
            println!("  First transaction: {}", sb.sequence);
            println!("Filesystem image {} ({} blocks)", cli.fs.display(), fs_blocks);
        }
        Commands::Commit {
            blocks,
            pattern,
            no_checkpoint,
        } => {
            let pattern = hex::decode(&pattern).with_context(|| format!("invalid pattern '{}'", pattern))?;
            if pattern.is_empty() {
                bail!("pattern must not be empty");
            }
            let journal = open(&cli.log, &cli.fs, config)?;

            let mut handle = journal.start_handle(blocks.len() as u32)?;
            for &blocknr in &blocks {
                let buffer = journal.buffer(blocknr)?;
                handle.get_write_access(&buffer)?;
                buffer.modify(|data| {
                    for (byte, value) in data.iter_mut().zip(pattern.iter().cycle()) {
                        *byte = *value;
                    }
                });
                handle.dirty_metadata(&buffer)?;
            }
            handle.stop()?;

            match journal.commit()? {
                Some(tid) => println!("Committed transaction {} ({} blocks)", tid, blocks.len()),
                None => println!("Nothing to commit"),
            }
            if !no_checkpoint {
                let stats = journal.checkpoint()?;
                println!("Checkpointed {} blocks", stats.blocks_written);
            }
        }
        Commands::Dump { verbose } => {
            let log = FileDevice::open(&cli.log, config.block_size)?;
            let sb = JournalSuperblock::decode(&log.read_block(0)?)?;
            println!("Journal superblock:");
            println!("  UUID: {}", hex::encode(sb.uuid));
            println!("  Block size: {}", sb.block_size);
            println!("  Log blocks: {} (first {})", sb.maxlen, sb.first);
            println!("  Sequence: {}", sb.sequence);
            if sb.is_empty_log() {
                println!("  Start: empty");
            } else {
                println!("  Start: {}", sb.start);
            }
            println!("  Errno: {}", sb.errno);
            println!("  Checksum: {:?}", sb.checksum_kind());
            println!(
                "  Features: compat {:#x}, incompat {:#x}, ro_compat {:#x}",
                sb.feature_compat, sb.feature_incompat, sb.feature_ro_compat
            );

            let info = scan_log(&log, &sb)?;
            println!("\nTransactions:");
            if info.transactions.is_empty() {
                println!("  none");
            }
            for txn in &info.transactions {
                println!(
                    "  {} at log block {}: {} blocks, {} descriptors, committed {}.{:09}",
                    txn.tid,
                    txn.log_start,
                    txn.blocks.len(),
                    txn.descriptors,
                    txn.commit.commit_sec,
                    txn.commit.commit_nsec
                );
                for block in &txn.blocks {
                    print!(
                        "    -> {} from log block {}{}",
                        block.target,
                        block.log_block,
                        if block.escaped { " (escaped)" } else { "" }
                    );
                    if verbose {
                        let data = log.read_block(block.log_block)?;
                        print!("  {}", hex::encode(&data[..32.min(data.len())]));
                    }
                    println!();
                }
            }
            if let Some(tid) = info.discarded {
                println!("  {} incomplete, would be discarded", tid);
            }
            println!("Next transaction: {}", info.next_tid);
        }
        Commands::Recover => {
            let log = Arc::new(FileDevice::open(&cli.log, config.block_size)?);
            let fs = Arc::new(FileDevice::open(&cli.fs, config.block_size)?);
            let (journal, info) = Journal::open(config, log, fs)?;
            println!(
                "Replayed {} transactions ({} blocks)",
                info.transactions.len(),
                info.replayed_blocks
            );
            if let Some(tid) = info.discarded {
                println!("Discarded incomplete transaction {}", tid);
            }
            println!("Next transaction: {}", journal.superblock().sequence);
        }
        Commands::Checkpoint => {
            let journal = open(&cli.log, &cli.fs, config)?;
            let stats = journal.checkpoint()?;
            println!(
                "Checkpoint: {} blocks written, {} transactions done, {} log blocks released",
                stats.blocks_written, stats.transactions_checkpointed, stats.log_blocks_released
            );
            println!("Log free blocks: {}", journal.log_free_blocks());
        }
    }

    Ok(())
}

/// Open both images, replaying whatever the log still holds.
fn open(log: &Path, fs: &Path, config: JournalConfig) -> anyhow::Result<Arc<Journal>> {
    let log = FileDevice::open(log, config.block_size)
        .with_context(|| format!("opening log image {}", log.display()))?;
    let fs = FileDevice::open(fs, config.block_size)
        .with_context(|| format!("opening filesystem image {}", fs.display()))?;
    let (journal, info) = Journal::open(config, Arc::new(log), Arc::new(fs))?;
    if info.replayed_blocks > 0 {
        log::info!("Replayed {} blocks before opening", info.replayed_blocks);
    }
    Ok(journal)
}
