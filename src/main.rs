//! Orchestrator for the replay fabric
//!
//! Wires one feed, one client and one recorder over a shared ring and
//! runs a pre-selected scenario. The exit code reflects only the final
//! correctness check: the client's accumulated sum must match the
//! recorder's expected sum within 1e-9. Warnings along the way (gaps,
//! overwrites, recovery cycles) are logged and counted but do not fail
//! the run.

use clap::{Parser, ValueEnum};
use mktdata_replay::{
    affinity, disk, Client, FaultKind, Feed, Recorder, RingBuffer, DEFAULT_RING_CAPACITY,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Tolerance for the client-vs-recorder sum comparison.
const SUM_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Basic end-to-end run without faults.
    Test,
    /// Inject a client crash and verify recovery.
    #[value(name = "recovery_test")]
    RecoveryTest,
    /// Same wiring as test, intended for high volumes and rates.
    Stress,
}

#[derive(Parser, Debug)]
#[command(
    name = "mktdata-replay",
    about = "Market-data replay fabric: broadcast, record, replay, recover"
)]
struct Cli {
    /// Scenario to run.
    #[arg(long, value_enum, default_value_t = Mode::Test)]
    mode: Mode,

    /// Number of messages to publish.
    #[arg(long, default_value_t = 10_000)]
    messages: i64,

    /// Publish rate in messages per second; 0 means unthrottled.
    #[arg(long, default_value_t = 1_000)]
    rate: i64,

    /// Sequence number at which to inject a client crash
    /// (recovery_test only; defaults to half the stream).
    #[arg(long = "fault-at")]
    fault_at: Option<i64>,

    /// Directory receiving the dated output file.
    #[arg(long = "data-dir", default_value = "data")]
    data_dir: PathBuf,

    /// Explicit output file path; overrides --data-dir.
    #[arg(long)]
    output: Option<PathBuf>,

    /// CPU cores for main,feed,client,recorder; missing entries are
    /// unpinned.
    #[arg(long, value_delimiter = ',')]
    cpu: Vec<usize>,
}

impl Cli {
    fn output_path(&self) -> PathBuf {
        match &self.output {
            Some(path) => path.clone(),
            None => self
                .data_dir
                .join(format!("mktdata_{}.bin", disk::current_date_yyyymmdd())),
        }
    }

    fn cpu_slot(&self, slot: usize) -> Option<usize> {
        self.cpu.get(slot).copied()
    }
}

struct Scenario {
    feed: Feed,
    client: Client,
    recorder: Recorder,
    messages: i64,
}

impl Scenario {
    fn build(cli: &Cli, output: &PathBuf) -> Result<Self, disk::DiskError> {
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let ring = Arc::new(RingBuffer::new(DEFAULT_RING_CAPACITY));

        let mut feed = Feed::new(Arc::clone(&ring));
        feed.set_message_count(cli.messages);
        feed.set_rate(cli.rate);
        feed.set_cpu_core(cli.cpu_slot(1));

        let mut client = Client::new(Arc::clone(&ring), output);
        client.set_cpu_core(cli.cpu_slot(2));

        let mut recorder = Recorder::new(Arc::clone(&ring), output);
        recorder.set_cpu_core(cli.cpu_slot(3));

        Ok(Self {
            feed,
            client,
            recorder,
            messages: cli.messages,
        })
    }

    fn start(&mut self) -> Result<(), disk::DiskError> {
        self.recorder.start()?;
        self.client.start();
        self.feed.start();
        Ok(())
    }

    /// Stop everything and report whether the sums agree.
    fn finish(&mut self, started: Instant) -> bool {
        self.feed.wait_for_complete();

        // Let the consumers drain the tail of the stream.
        let deadline = Instant::now() + Duration::from_secs(5);
        while (self.client.last_seq() < self.messages - 1
            || self.recorder.last_seq() < self.messages - 1)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(100));

        self.client.stop();
        self.recorder.stop();

        let elapsed = started.elapsed();
        let client_sum = self.client.sum();
        let expected_sum = self.recorder.expected_sum();
        let diff = (client_sum - expected_sum).abs();
        let passed = diff < SUM_TOLERANCE;

        println!();
        println!("=== Results ===");
        println!("Total time:         {} ms", elapsed.as_millis());
        println!("Feed sent:          {}", self.feed.sent_count());
        println!("Client processed:   {}", self.client.processed_count());
        println!("Recorder recorded:  {}", self.recorder.recorded_count());
        println!("Client sum:         {client_sum:.6}");
        println!("Expected sum:       {expected_sum:.6}");
        println!();
        println!(
            "Verification: {}",
            if passed { "PASSED" } else { "FAILED" }
        );

        info!(
            sent = self.feed.sent_count(),
            client_processed = self.client.processed_count(),
            recorder_recorded = self.recorder.recorded_count(),
            duration_ms = elapsed.as_millis() as u64,
            passed,
            "run complete"
        );

        passed
    }
}

fn run_test(cli: &Cli) -> Result<bool, disk::DiskError> {
    let output = cli.output_path();
    println!("=== Functional run ===");
    println!("Messages: {}", cli.messages);
    println!("Rate:     {}/s", cli.rate);
    println!("Output:   {}", output.display());

    let mut scenario = Scenario::build(cli, &output)?;
    let started = Instant::now();
    scenario.start()?;
    Ok(scenario.finish(started))
}

fn run_recovery_test(cli: &Cli) -> Result<bool, disk::DiskError> {
    let output = cli.output_path();
    let fault_at = cli.fault_at.unwrap_or(cli.messages / 2);

    println!("=== Recovery run ===");
    println!("Messages: {}", cli.messages);
    println!("Fault at: {fault_at}");
    println!("Output:   {}", output.display());

    let mut scenario = Scenario::build(cli, &output)?;
    let started = Instant::now();
    scenario.start()?;

    while scenario.client.last_seq() < fault_at && scenario.feed.is_running() {
        thread::sleep(Duration::from_millis(10));
    }

    println!("Injecting client crash...");
    scenario.client.trigger_fault(FaultKind::ClientCrash);
    scenario.client.wait_for_recovery();
    println!("Recovery complete");
    info!("client recovery completed");

    Ok(scenario.finish(started))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    mktdata_replay::init_logging();

    info!(
        mode = ?cli.mode,
        messages = cli.messages,
        rate = cli.rate,
        fault_at = cli.fault_at,
        output = %cli.output_path().display(),
        "replay fabric starting"
    );

    affinity::pin_current_thread(cli.cpu_slot(0), "main");

    let result = match cli.mode {
        Mode::Test | Mode::Stress => run_test(&cli),
        Mode::RecoveryTest => run_recovery_test(&cli),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %err, "run failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
