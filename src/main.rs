use clap::{Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use xfer::config::Config;
use xfer::delegate::{ConnectionDelegate, DelegateBuilder};
use xfer::logging::*;
use xfer::progress::CliProgress;
use xfer::types::{EntryKind, Operation, OverwritePolicy};
use xfer::uploader::Uploader;
use xfer::{Completion, Connection, ConnectionBuilder, OperationRequest};

///////////////////////
// Utility functions //
///////////////////////

fn cli() -> Command {
	let path = |name: &'static str| Arg::new(name).required(true);
	Command::new("xfer")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Queued remote file transfer client")
		.subcommand_required(true)
		.arg(Arg::new("config").short('c').long("config").value_name("FILE").help("Config file"))
		.arg(Arg::new("url").required(true).help("Server URL, e.g. file:///srv/data/"))
		.subcommand(
			Command::new("ls")
				.about("List a directory")
				.arg(Arg::new("path").default_value("/"))
				.arg(Arg::new("json").long("json").action(ArgAction::SetTrue).help("JSON output")),
		)
		.subcommand(
			Command::new("mkdir")
				.about("Create a directory")
				.arg(path("path"))
				.arg(Arg::new("mode").short('m').long("mode").help("Octal permissions")),
		)
		.subcommand(Command::new("rm").about("Delete a file").arg(path("path")))
		.subcommand(Command::new("rmdir").about("Delete a directory").arg(path("path")))
		.subcommand(Command::new("mv").about("Rename a file").arg(path("from")).arg(path("to")))
		.subcommand(
			Command::new("chmod").about("Set permissions").arg(path("mode")).arg(path("path")),
		)
		.subcommand(
			Command::new("put")
				.about("Upload a file")
				.arg(path("local"))
				.arg(path("remote"))
				.arg(Arg::new("resume").long("resume").action(ArgAction::SetTrue)),
		)
		.subcommand(
			Command::new("get")
				.about("Download a file; local '-' writes to stdout")
				.arg(path("remote"))
				.arg(path("local"))
				.arg(Arg::new("resume").long("resume").action(ArgAction::SetTrue)),
		)
		.subcommand(Command::new("exists").about("Check whether a path exists").arg(path("path")))
		.subcommand(
			Command::new("put-tree")
				.about("Upload a directory recursively")
				.arg(path("local"))
				.arg(path("remote"))
				.arg(Arg::new("dry-run").short('n').long("dry-run").action(ArgAction::SetTrue))
				.arg(
					Arg::new("concurrency")
						.short('j')
						.long("concurrency")
						.value_parser(clap::value_parser!(usize)),
				)
				.arg(
					Arg::new("overwrite")
						.long("overwrite")
						.value_parser(["overwrite", "skip", "ask"]),
				)
				.arg(Arg::new("exclude").short('x').long("exclude").action(ArgAction::Append)),
		)
}

fn parse_mode(mode: &str) -> Result<u32, Box<dyn Error>> {
	u32::from_str_radix(mode, 8).map_err(|_| format!("invalid octal mode: {}", mode).into())
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str, Box<dyn Error>> {
	matches
		.get_one::<String>(name)
		.map(|s| s.as_str())
		.ok_or_else(|| format!("missing argument: {}", name).into())
}

/// Delegate printing what read-only commands return
fn printing_delegate(json: bool) -> Arc<dyn ConnectionDelegate> {
	DelegateBuilder::new()
		.on_directory_contents(move |_, _, entries| {
			if json {
				match serde_json::to_string_pretty(entries) {
					Ok(text) => println!("{}", text),
					Err(e) => error!("cannot encode listing: {}", e),
				}
				return;
			}
			for entry in entries {
				let kind = match entry.kind {
					EntryKind::Directory => 'd',
					EntryKind::Symlink => 'l',
					EntryKind::File => '-',
				};
				let mode = entry.permissions.map(|m| format!("{:o}", m)).unwrap_or_default();
				println!("{} {:>4} {:>12} {}", kind, mode, entry.size, entry.name);
			}
		})
		.on_existence(|_, path, exists| {
			println!("{}: {}", path, if exists { "exists" } else { "not found" });
		})
		.on_data(|_, data| {
			let mut out = std::io::stdout();
			let _ = out.write_all(data);
			let _ = out.flush();
		})
		.on_fail(|err| warn!("{}", err))
		.build()
}

async fn run(
	connection: &Connection,
	config: &Config,
	command: &str,
	sub: &ArgMatches,
) -> Result<(), Box<dyn Error>> {
	let operation = match command {
		"ls" => Operation::DirectoryContents { path: arg(sub, "path")?.to_string() },
		"mkdir" => Operation::CreateDirectory {
			path: arg(sub, "path")?.to_string(),
			permissions: sub.get_one::<String>("mode").map(|m| parse_mode(m)).transpose()?,
			ignore_existing: false,
		},
		"rm" => Operation::DeleteFile { path: arg(sub, "path")?.to_string() },
		"rmdir" => Operation::DeleteDirectory { path: arg(sub, "path")?.to_string() },
		"mv" => Operation::Rename {
			from: arg(sub, "from")?.to_string(),
			to: arg(sub, "to")?.to_string(),
		},
		"chmod" => Operation::SetPermissions {
			path: arg(sub, "path")?.to_string(),
			mode: parse_mode(arg(sub, "mode")?)?,
		},
		"exists" => Operation::CheckExistence {
			path: arg(sub, "path")?.to_string(),
			on_exists: xfer::types::ExistsAction::Report,
		},
		"put" => {
			let local = Path::new(arg(sub, "local")?);
			let offset = match sub.get_flag("resume") {
				true => remote_size(connection, arg(sub, "remote")?).await?,
				false => 0,
			};
			Operation::Upload {
				source: xfer::types::UploadSource::File(local.to_path_buf()),
				remote_path: arg(sub, "remote")?.to_string(),
				offset,
			}
		}
		"get" => {
			let local = arg(sub, "local")?;
			let (target, offset) = if local == "-" {
				(xfer::types::DownloadTarget::Memory, 0)
			} else {
				let offset = match sub.get_flag("resume") {
					true => tokio::fs::metadata(local).await.map(|m| m.len()).unwrap_or(0),
					false => 0,
				};
				(xfer::types::DownloadTarget::File(local.into()), offset)
			};
			Operation::Download { remote_path: arg(sub, "remote")?.to_string(), target, offset }
		}
		"put-tree" => return put_tree(connection, config, sub).await,
		other => return Err(format!("unknown command: {}", other).into()),
	};

	let to_stdout = command == "get" && sub.get_one::<String>("local").is_some_and(|l| l == "-");
	let progress = Arc::new(CliProgress::new());
	if operation.is_transfer() && !to_stdout {
		connection.set_delegate(progress.clone()).await?;
	}
	let completion = connection.perform(OperationRequest::new(operation)).await;
	progress.finish();
	if completion? == Completion::Skipped {
		info!("skipped: remote file exists");
	}
	Ok(())
}

/// Size of a remote file, for resuming uploads
async fn remote_size(connection: &Connection, path: &str) -> Result<u64, Box<dyn Error>> {
	let (dir, name) = match path.rsplit_once('/') {
		Some(("", name)) => ("/", name),
		Some((dir, name)) => (dir, name),
		None => (".", path),
	};
	let (tx, rx) = tokio::sync::oneshot::channel();
	let tx = std::sync::Mutex::new(Some(tx));
	let wanted = name.to_string();
	let delegate = DelegateBuilder::new()
		.on_directory_contents(move |_, _, entries| {
			let size = entries.iter().find(|e| e.name == wanted).map(|e| e.size).unwrap_or(0);
			if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
				let _ = tx.send(size);
			}
		})
		.build();
	connection.set_delegate(delegate).await?;
	connection
		.perform(OperationRequest::new(Operation::DirectoryContents { path: dir.to_string() }))
		.await?;
	Ok(rx.await.unwrap_or(0))
}

async fn put_tree(
	connection: &Connection,
	config: &Config,
	sub: &ArgMatches,
) -> Result<(), Box<dyn Error>> {
	let mut uploader_config = config.uploader.clone();
	if sub.get_flag("dry-run") {
		uploader_config.dry_run = true;
	}
	if let Some(n) = sub.get_one::<usize>("concurrency") {
		uploader_config.max_concurrent = *n;
	}
	if let Some(policy) = sub.get_one::<String>("overwrite") {
		uploader_config.overwrite = policy.parse::<OverwritePolicy>()?;
	}
	if let Some(patterns) = sub.get_many::<String>("exclude") {
		uploader_config.exclude_patterns.extend(patterns.cloned());
	}
	let mut checked = config.clone();
	checked.uploader = uploader_config.clone();
	checked.validate()?;

	let progress = Arc::new(CliProgress::new());
	connection.set_delegate(progress.clone()).await?;
	let report = Uploader::new(uploader_config)
		.upload(connection, Path::new(arg(sub, "local")?), arg(sub, "remote")?)
		.await?;
	progress.finish();
	report.root.release();

	if report.dry_run {
		for dir in &report.directories {
			println!("mkdir {}", dir.remote);
		}
		for file in &report.files {
			println!("put {} -> {} ({} bytes)", file.local.display(), file.remote, file.size);
		}
		return Ok(());
	}
	info!(
		"{} uploaded ({} bytes), {} skipped, {} failed",
		report.uploaded, report.bytes, report.skipped, report.failed
	);
	for err in &report.errors {
		error!("{}", err);
	}
	if report.is_success() {
		Ok(())
	} else {
		Err(format!("{} errors during upload", report.errors.len()).into())
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let matches = cli().get_matches();

	let config = Config::load_or_default(matches.get_one::<String>("config").map(Path::new))?;
	init_tracing(&config.log_level);

	let url = arg(&matches, "url")?;
	let (command, sub) = matches.subcommand().ok_or("a command is required")?;
	let json = sub.try_get_one::<bool>("json").ok().flatten().copied().unwrap_or(false);
	let connection = ConnectionBuilder::new(url)
		.config(config.clone())
		.delegate(printing_delegate(json))
		.build()?;

	connection.connect().await?;
	connection.wait_until_open().await?;
	debug!("connected to {}", connection.url());

	let result = run(&connection, &config, command, sub).await;

	connection.disconnect().await?;
	connection.wait_until_disconnected().await;
	connection.shutdown().await;
	result
}

// vim: ts=4
