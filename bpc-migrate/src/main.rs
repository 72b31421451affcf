//! `migrateV3toV4` — converts legacy V3 backups to the V4 refcounted pool layout, one backup
//! (or a whole host's, or the whole pool's) at a time.

use anyhow::{bail, Context, Result};
use bpc_core::backups::BackupList;
use bpc_core::engine::EngineState;
use bpc_core::error::BpcError;
use bpc_core::mig::{migrate_backup, MigrationRequest};
use bpc_core::pool::FsPoolWriter;
use bpc_core::walk::StdDirWalk;
use bpcutil::hostlock::{FileLock, HostLock};
use bpcutil::serverprobe::ConfigServerProbe;
use bpcutil::util::get_hostname;
use bpcutil::{Config, Progress};
use std::env;
use std::fs;
use std::process::ExitCode;

struct Args {
	all_hosts: bool,
	host: Option<String>,
	num: Option<u32>,
	/// `-m`: dry run — walk and report, write nothing. Not to be confused with `backupDelete`'s
	/// `-m`, which skips mutex acquisition; `migrateV3toV4` always takes the host lock.
	dry_run: bool,
	quiet: bool,
	verbose: u8,
}

const USAGE: &str = "usage: migrateV3toV4 -a | -h HOST [-n NUM] [-m] [-p] [-v]";

fn parse_args() -> Result<Args> {
	let mut args = Args {
		all_hosts: false,
		host: None,
		num: None,
		dry_run: false,
		quiet: false,
		verbose: 0,
	};
	let mut it = env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"-a" => args.all_hosts = true,
			"-h" => args.host = Some(it.next().context("-h requires a host")?),
			"-n" => {
				let v = it.next().context("-n requires a backup number")?;
				args.num = Some(v.parse().context("-n expects an integer")?);
			}
			"-m" => args.dry_run = true,
			"-p" => args.quiet = true,
			"-v" => args.verbose += 1,
			other => bail!("unrecognized argument: {other}\n{USAGE}"),
		}
	}
	if args.all_hosts == args.host.is_some() {
		bail!("{USAGE}");
	}
	if args.all_hosts && args.num.is_some() {
		bail!("-n only applies to a single host\n{USAGE}");
	}
	Ok(args)
}

fn main() -> ExitCode {
	match run() {
		Ok(0) => ExitCode::SUCCESS,
		Ok(_) => ExitCode::FAILURE,
		Err(e) => {
			eprintln!("migrateV3toV4: {e:#}");
			ExitCode::FAILURE
		}
	}
}

fn run() -> Result<u32> {
	let args = parse_args()?;
	let cfg = Config::load().context("loading config")?;
	bpcutil::logging::init(cfg.xfer_log_level.saturating_add(args.verbose));
	log::info!("migrateV3toV4 starting on {}", get_hostname());

	let hosts = if args.all_hosts {
		list_hosts(&cfg.top_dir)?
	} else {
		vec![args.host.clone().unwrap()]
	};

	let mut total_errors = 0u32;
	for host in hosts {
		total_errors += migrate_host(&cfg, &host, args.num, args.dry_run, args.quiet)?;
	}
	Ok(total_errors)
}

fn list_hosts(top_dir: &std::path::Path) -> Result<Vec<String>> {
	let pc_dir = top_dir.join("pc");
	let mut hosts = Vec::new();
	let rd = match fs::read_dir(&pc_dir) {
		Ok(rd) => rd,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hosts),
		Err(e) => return Err(e).with_context(|| format!("reading {}", pc_dir.display())),
	};
	for entry in rd {
		let entry = entry?;
		if entry.file_type()?.is_dir() {
			hosts.push(entry.file_name().to_string_lossy().into_owned());
		}
	}
	hosts.sort();
	Ok(hosts)
}

fn migrate_host(
	cfg: &Config,
	host: &str,
	only_num: Option<u32>,
	dry_run: bool,
	quiet: bool,
) -> Result<u32> {
	let host_dir = cfg.host_dir(host);

	// Unlike `backupDelete`, migration has no mutex-skip flag: `-m` means dry run here, and even
	// a dry run takes the lock, since it still reads the backup list and in-flight V3 tree.
	let lock = match FileLock::try_acquire(&host_dir).context("acquiring host lock")? {
		Some(lock) => lock,
		None => return Err(BpcError::LockUnavailable(host.to_owned()).into()),
	};
	log::debug!("holding {}", lock.path().display());
	let _lock: Box<dyn HostLock> = Box::new(lock);

	let probe = ConfigServerProbe::new(cfg.server_host.clone(), cfg.server_port);

	let mut list = BackupList::load(&host_dir).with_context(|| format!("loading backup list for {host}"))?;
	let host_inode_floor = list.backups.iter().map(|b| b.inode_last).max().unwrap_or(0);

	let targets: Vec<u32> = list
		.backups
		.iter()
		.filter(|b| b.version == 3)
		.filter(|b| only_num.map_or(true, |n| n == b.num))
		.map(|b| b.num)
		.collect();

	let walk = StdDirWalk;
	let mut total_errors = 0u32;

	for num in targets {
		let progress = Progress::new(quiet);
		let mut state = EngineState::new(progress);
		state.legacy_read_only = cfg.legacy_read_only;
		let backup = list.find_mut(num).expect("listed above");
		let pool_writer = FsPoolWriter::new(bpc_core::pool::PoolLayout::new(cfg.pool_dir(backup.compress)));
		let req = MigrationRequest {
			host: host.to_owned(),
			backup_num: num,
		};
		let outcome = migrate_backup(
			&cfg.top_dir,
			&req,
			backup,
			&walk,
			&pool_writer,
			host_inode_floor,
			cfg.ref_cnt_fsck,
			dry_run,
			&probe,
			&mut state,
		)
		.with_context(|| format!("migrating {host}#{num}"))?;
		total_errors += outcome.errors;
	}

	list.save(&host_dir).with_context(|| format!("saving backup list for {host}"))?;
	Ok(total_errors)
}
