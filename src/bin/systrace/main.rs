// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

mod tracer;

use crate::tracer::{wait_for_sigtrap, Tracer};
use anyhow::{ensure, Context, Result};
use bstr::BString;
use clap::Parser;
use nix::{
    sys::ptrace,
    unistd::{getgid, getuid, Pid},
};
use std::{
    fs::File,
    io::{stdout, BufReader, BufWriter, Write},
    mem,
    os::unix::{ffi::OsStrExt, prelude::CommandExt},
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
    time::Duration,
};
use stderrlog::StdErrLog;
use systrace::{
    daemon::{DaemonConfig, PolicyDaemon},
    engine::{EngineConfig, Interceptor},
    pod::ProcMem,
    registration::Registry,
    SystraceSpec,
};

#[derive(Debug, Parser)]
struct Args {
    /// Decreases the log level.
    #[clap(
        short,
        long,
        conflicts_with("verbose"),
        max_occurrences(2),
        parse(from_occurrences)
    )]
    quiet: usize,

    /// Increases the log level.
    #[clap(
        short,
        long,
        conflicts_with("quiet"),
        max_occurrences(3),
        parse(from_occurrences)
    )]
    verbose: usize,

    /// The JSON file naming the command to run and the policy to run it under.
    systrace_spec_path: PathBuf,

    /// The file to write the audit log to. If not provided, will output to stdout.
    output_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Get the command-line arguments.
    let args = Args::parse();

    // Set up logging.
    {
        let mut logger = StdErrLog::new();
        match args.quiet {
            0 => logger.verbosity(1 + args.verbose),
            1 => logger.verbosity(0),
            2 => logger.quiet(true),
            // UNREACHABLE: A maximum of two occurrences of quiet are allowed.
            _ => unreachable!(),
        };
        // UNWRAP: No other logger should be set up.
        logger.show_module_names(true).init().unwrap()
    }

    // Read what to run, and under which policy, from the file named on the command line.
    let mut spec = {
        let file = File::open(&args.systrace_spec_path).context("Failed to open spec file")?;
        serde_json::from_reader::<_, SystraceSpec>(BufReader::new(file))
            .context("Failed to read spec file")?
    };

    // Check that it makes sense.
    ensure!(spec.binary.is_absolute(), "binary must be an absolute path");
    ensure!(
        !spec.args.is_empty(),
        "args must contain at least one entry (for argv[0])"
    );
    ensure!(spec.cwd.is_absolute(), "cwd must be an absolute path");
    ensure!(spec.workers > 0, "workers must be at least one");

    // Set up the engine and the policy daemon before anything gets traced.
    let registry = Arc::new(
        Registry::builtin(spec.catalog.as_deref()).context("Failed to register syscalls")?,
    );
    let (engine, device) = Interceptor::new(
        Arc::new(ProcMem),
        EngineConfig {
            orphan_timeout: Duration::from_millis(spec.orphan_timeout_ms),
        },
    );
    let daemon = Arc::new(PolicyDaemon::new(
        registry,
        mem::take(&mut spec.policy),
        DaemonConfig {
            workers: spec.workers,
            cache_decisions: spec.cache_decisions,
            report_results: spec.report_results,
            ..DaemonConfig::default()
        },
    ));
    let workers = daemon.serve(Arc::new(device))?;

    // Construct the builder for the subprocess.
    let mut command = Command::new(&spec.binary);
    command
        .arg0(&spec.args[0])
        .args(&spec.args[1..])
        .env_clear()
        .envs(&spec.env)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // UNSAFE: Our obligations are to not call async-signal-unsafe functions in the closure.
    // ptrace(2) doesn't mention signal safety, but this use is recommended in it, and it certainly
    // shouldn't be trying to mutate any process-global state.
    unsafe {
        command.pre_exec(|| {
            // Make ourselves available for ptracing.
            ptrace::traceme()?;
            Ok(())
        });
    }

    log::debug!("About to spawn subprocess: {:#?}", command);
    let mut child = command.spawn().context("Failed to spawn child process")?;

    // The execve() performed by the child results in a SIGTRAP due to ptrace::traceme().
    let child_pid = Pid::from_raw(child.id() as i32);
    wait_for_sigtrap(child_pid).context("Failed to wait for child to be ready to ptrace")?;

    // Ensure that the child process won't outlive us, and that we follow it into its children.
    ptrace::setoptions(
        child_pid,
        ptrace::Options::PTRACE_O_EXITKILL
            | ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEEXEC,
    )
    .context("Failed to set child ptrace options")?;

    engine.attach(child_pid, "linux");
    engine.set_ugid(child_pid, getuid().as_raw(), getgid().as_raw());
    engine.execve(
        child_pid,
        BString::from(spec.binary.as_os_str().as_bytes().to_vec()),
    );

    let result = Tracer::new(Arc::clone(&engine)).run(child_pid);

    // Let the daemon drain what's left, then stop it.
    engine.shutdown();
    workers.join()?;

    let audit = daemon.audit();
    log::info!(
        "{} decisions, {} results",
        audit.decisions.len(),
        audit.results.len()
    );
    let output_path = args.output_path;
    let write_audit = move || -> Result<()> {
        match output_path {
            Some(path) => {
                let mut writer = BufWriter::new(
                    File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?,
                );
                serde_json::to_writer(&mut writer, &audit)?;
                writer.flush()?;
            }
            None => serde_json::to_writer_pretty(stdout(), &audit)?,
        }
        Ok(())
    };

    match result {
        Ok(status) => {
            log::info!("Child {}", status);
            write_audit()
        }

        // If there was an error, we SIGKILL the child before reporting it. What was decided so far
        // is still written out.
        Err(err) => {
            // The child may have exited already.
            let _ = child.kill();
            write_audit()?;
            Err(err)
        }
    }
}
