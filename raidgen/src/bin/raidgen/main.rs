// vim: tw=80
//! Inspect how raidgen decomposes block operations
use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{crate_version, Parser};
use raidgen_core::{
    block_op::{BlockOperation, Opcode, PreRead},
    config::RaidGroupConfig,
    raid_group::RaidGroup,
    siots::FruStatus,
    transport::RecordingTransport,
    Position,
};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum Error {
    #[error("cannot read {path}: {source}")]
    Config {
        path: PathBuf,
        source: io::Error,
    },
    #[error(transparent)]
    Raid(#[from] raidgen_core::Error),
    #[error("cannot format output: {0}")]
    Output(#[from] serde_yaml_ng::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn parse_opcode(s: &str) -> std::result::Result<Opcode, String> {
    let opcode = match s {
        "read" => Opcode::Read,
        "write" => Opcode::Write,
        "write-verify" => Opcode::WriteVerify,
        "write-non-cached" => Opcode::WriteNonCached,
        "verify-write" => Opcode::VerifyWrite,
        "write-zeros" => Opcode::WriteZeros,
        "corrupt-data" => Opcode::CorruptData,
        "zero" => Opcode::Zero,
        "unmark-zero" => Opcode::UnmarkZero,
        "check-zeroed" => Opcode::CheckZeroed,
        "verify" => Opcode::Verify,
        "read-only-verify" => Opcode::ReadOnlyVerify,
        "error-verify" => Opcode::ErrorVerify,
        "rebuild" => Opcode::Rebuild,
        _ => return Err(format!("unknown opcode \"{s}\""))
    };
    Ok(opcode)
}

/// Parse "LBA,BLOCKS"
fn parse_pre_read(s: &str) -> std::result::Result<PreRead, String> {
    let (lba, blocks) = s.split_once(',')
        .ok_or_else(|| String::from("expected LBA,BLOCKS"))?;
    let lba = lba.parse().map_err(|e| format!("bad LBA: {e}"))?;
    let blocks = blocks.parse().map_err(|e| format!("bad count: {e}"))?;
    Ok(PreRead{lba, blocks})
}

/// Parse "POSITION:STATUS", where STATUS is "retryable", "dead" or
/// "media@LBA"
fn parse_fault(s: &str)
    -> std::result::Result<(Position, FruStatus), String>
{
    let (pos, status) = s.split_once(':')
        .ok_or_else(|| String::from("expected POSITION:STATUS"))?;
    let pos = pos.parse().map_err(|e| format!("bad position: {e}"))?;
    let status = match status {
        "retryable" => FruStatus::Retryable,
        "dead" => FruStatus::Dead,
        s => {
            let lba = s.strip_prefix("media@")
                .ok_or_else(|| format!("unknown status \"{s}\""))?
                .parse()
                .map_err(|e| format!("bad LBA: {e}"))?;
            FruStatus::MediaError(lba)
        }
    };
    Ok((pos, status))
}

fn load(path: &Path) -> Result<RaidGroupConfig> {
    let s = fs::read_to_string(path)
        .map_err(|source| Error::Config{path: path.to_owned(), source})?;
    Ok(RaidGroupConfig::from_yaml(&s)?)
}

/// Build an operation using the block sizes that `rg` exports
fn new_op(rg: &RaidGroup, opcode: Opcode, lba: u64, blocks: u64)
    -> BlockOperation
{
    let g = rg.geometry().config();
    BlockOperation::new(opcode, lba, blocks)
        .with_block_sizes(g.block_size, g.optimal_block_size)
}

#[derive(Parser, Clone, Debug)]
/// Show how an operation would be split, without running it
struct Plan {
    /// Raid group configuration file
    config: PathBuf,
    #[clap(value_parser = parse_opcode)]
    opcode: Opcode,
    lba: u64,
    blocks: u64,
    /// Range already pre-read by the caller, as LBA,BLOCKS
    #[clap(long, value_parser = parse_pre_read)]
    pre_read: Option<PreRead>,
}

impl Plan {
    fn main(self) -> Result<()> {
        let config = load(&self.config)?;
        let rg = RaidGroup::from_config(&config,
            Arc::new(RecordingTransport::new()))?;
        let mut op = new_op(&rg, self.opcode, self.lba, self.blocks);
        if let Some(pr) = self.pre_read {
            op = op.with_pre_read(pr.lba, pr.blocks);
        }
        let summary = rg.plan(op)?;
        print!("{}", serde_yaml_ng::to_string(&summary)?);
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Translate logical addresses to member addresses
struct Translate {
    /// Raid group configuration file
    config: PathBuf,
    #[clap(num_args(1..), required(true))]
    lbas: Vec<u64>,
}

impl Translate {
    fn main(self) -> Result<()> {
        let config = load(&self.config)?;
        let g = config.geometry()?;
        for lba in self.lbas {
            if lba >= g.capacity() {
                eprintln!("{lba}: beyond the end of the group");
                return Err(raidgen_core::Error::InvalidRequest.into());
            }
            let x = g.translate(lba, u64::MAX);
            let pm = g.positions(lba);
            println!("- lba: {lba}");
            println!("  position: {}", x.position);
            println!("  member_lba: {}", x.member_lba);
            println!("  stripe: {}", x.stripe_index);
            println!("  parity_stripe: {}", x.parity_stripe);
            println!("  to_parity_stripe_end: {}", x.max_blocks);
            println!("  data_positions: {:?}", pm.data());
            println!("  redundant_positions: {:?}", pm.redundant());
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Run an operation against simulated member drives
struct Simulate {
    /// Raid group configuration file
    config: PathBuf,
    #[clap(value_parser = parse_opcode)]
    opcode: Opcode,
    lba: u64,
    blocks: u64,
    /// Fail every request to a member, as POSITION:STATUS
    #[clap(long = "fail", value_parser = parse_fault)]
    fail: Vec<(Position, FruStatus)>,
    /// Fail just the next request to a member, as POSITION:STATUS
    #[clap(long = "fail-once", value_parser = parse_fault)]
    fail_once: Vec<(Position, FruStatus)>,
    /// Print every member request
    #[clap(short, long)]
    requests: bool,
}

impl Simulate {
    async fn main(self) -> Result<()> {
        let config = load(&self.config)?;
        let transport = Arc::new(RecordingTransport::new());
        for (pos, status) in self.fail {
            transport.fail_always(pos, status);
        }
        for (pos, status) in self.fail_once {
            transport.fail_next(pos, status);
        }
        let rg = RaidGroup::from_config(&config, transport.clone())?;
        let op = new_op(&rg, self.opcode, self.lba, self.blocks);
        tracing::debug!(?op, "simulating");
        let r = rg.execute(op).await;
        if self.requests {
            print!("{}", serde_yaml_ng::to_string(&transport.requests())?);
        }
        let summary = r?;
        print!("{}", serde_yaml_ng::to_string(&summary)?);
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Replay the write log, as after a restart
struct Flush {
    /// Raid group configuration file
    config: PathBuf,
    /// Fail every request to a member, as POSITION:STATUS
    #[clap(long = "fail", value_parser = parse_fault)]
    fail: Vec<(Position, FruStatus)>,
    /// Print every member request
    #[clap(short, long)]
    requests: bool,
}

impl Flush {
    async fn main(self) -> Result<()> {
        let config = load(&self.config)?;
        let transport = Arc::new(RecordingTransport::new());
        for (pos, status) in self.fail {
            transport.fail_always(pos, status);
        }
        let rg = RaidGroup::from_config(&config, transport.clone())?;
        if let Some(log) = rg.write_log() {
            log.mark_all_for_flush();
        }
        let r = rg.flush_write_log().await;
        if self.requests {
            print!("{}", serde_yaml_ng::to_string(&transport.requests())?);
        }
        println!("flushed: {}", r?);
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Flush(Flush),
    Plan(Plan),
    Simulate(Simulate),
    Translate(Translate),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli: Cli = Cli::parse();
    match cli.cmd {
        SubCommand::Flush(flush) => flush.main().await,
        SubCommand::Plan(plan) => plan.main(),
        SubCommand::Simulate(simulate) => simulate.main().await,
        SubCommand::Translate(translate) => translate.main(),
    }
}
