//! `backupDelete` — deletes a V4 backup (or a share/path within one), folding it into its
//! predecessor first when the predecessor is an eligible merge candidate.

use anyhow::{bail, Context, Result};
use bpc_core::del::{run_delete, DeleteRequest, DeleteScope};
use bpc_core::engine::EngineState;
use bpc_core::error::BpcError;
use bpcutil::hostlock::{FileLock, HostLock};
use bpcutil::{Config, Progress};
use std::env;
use std::process::ExitCode;

struct Args {
	host: Option<String>,
	num: Option<u32>,
	force_keep: bool,
	keep_logs: bool,
	tee: bool,
	skip_mutex: bool,
	quiet: bool,
	share: Option<String>,
	paths: Vec<String>,
}

const USAGE: &str = "usage: backupDelete -h HOST -n NUM [-f] [-l] [-L] [-m] [-p] [-r] [-s SHARE [PATH...]]";

fn parse_args() -> Result<Args> {
	let mut args = Args {
		host: None,
		num: None,
		force_keep: false,
		keep_logs: false,
		tee: false,
		skip_mutex: false,
		quiet: false,
		share: None,
		paths: Vec::new(),
	};
	let mut it = env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"-h" => args.host = Some(it.next().context("-h requires a host")?),
			"-n" => {
				let v = it.next().context("-n requires a backup number")?;
				args.num = Some(v.parse().context("-n expects an integer")?);
			}
			"-f" => args.force_keep = true,
			"-l" => args.keep_logs = true,
			"-L" => args.tee = true,
			"-m" => args.skip_mutex = true,
			"-p" => args.quiet = true,
			"-r" => { /* final refcount reconciliation is the external refCountUpdate tool, out of scope here */ }
			"-s" => {
				args.share = Some(it.next().context("-s requires a share name")?);
				args.paths.extend(&mut it);
			}
			other => bail!("unrecognized argument: {other}\n{USAGE}"),
		}
	}
	if args.host.is_none() || args.num.is_none() {
		bail!("{USAGE}");
	}
	Ok(args)
}

fn main() -> ExitCode {
	match run() {
		Ok(0) => ExitCode::SUCCESS,
		Ok(_) => ExitCode::FAILURE,
		Err(e) => {
			eprintln!("backupDelete: {e:#}");
			ExitCode::FAILURE
		}
	}
}

fn run() -> Result<u32> {
	let args = parse_args()?;
	let cfg = Config::load().context("loading config")?;
	bpcutil::logging::init(cfg.xfer_log_level);

	let host = args.host.clone().unwrap();
	let num = args.num.unwrap();

	let _lock: Box<dyn HostLock> = if args.skip_mutex {
		Box::new(FileLock::bypassed())
	} else {
		let host_dir = cfg.host_dir(&host);
		match FileLock::try_acquire(&host_dir).context("acquiring host lock")? {
			Some(lock) => {
				log::debug!("holding {}", lock.path().display());
				Box::new(lock)
			}
			None => return Err(BpcError::LockUnavailable(host).into()),
		}
	};

	let progress = if args.tee {
		Progress::with_tee(args.quiet, &cfg.log_dir, &host).context("opening host log")?
	} else {
		Progress::new(args.quiet)
	};
	let mut state = EngineState::new(progress);
	state.legacy_read_only = cfg.legacy_read_only;

	let scope = match args.share {
		Some(share) => DeleteScope::Share {
			share,
			paths: args.paths,
		},
		None => DeleteScope::WholeBackup,
	};

	let req = DeleteRequest {
		host,
		backup_num: num,
		scope,
		force_keep: args.force_keep,
		keep_logs: args.keep_logs,
		ref_cnt_fsck: cfg.ref_cnt_fsck,
	};

	let outcome = run_delete(&cfg.top_dir, &req, &mut state).context("deletion failed")?;
	Ok(outcome.errors)
}
