use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use logbridge_api::{LogBridgeApi, PriorBackup};
use logbridge_core::{CounterpartyRules, Cutoff, DisplayZone, RunConfig};
use time::UtcOffset;
use tracing_subscriber::EnvFilter;

const SELF_NUMBER_PROMPT: &str = "Enter your phone number (for WhatsApp subscription ID): ";
const CUTOFF_PROMPT: &str = "Input the last Java timestamp in the existing database on the phone (or press Enter to write all rows): ";
const CUTOFF_RETRY: &str = "Invalid input. Please enter a numeric timestamp or press Enter.";

#[derive(Debug, Parser)]
#[command(name = "logbridge")]
#[command(about = "Migrate iOS call and message history into SMS Backup & Restore XML")]
struct Cli {
    /// Log row-level decisions (debug level).
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Extract call history (`CallHistory.storedata`) into a staging CSV.
    CallsToCsv(CallsToCsvArgs),
    /// Convert a call staging CSV into a `<calls>` backup document.
    CallsToXml(CallsToXmlArgs),
    /// Extract messages (`chat.db`) into a staging CSV.
    SmsToCsv(SmsToCsvArgs),
    /// Convert a message staging CSV into an `<smses>` backup document.
    SmsToXml(SmsToXmlArgs),
}

#[derive(Debug, Args)]
struct DisplayArgs {
    /// Render readable dates at a fixed offset (`+05:30`, `UTC`) instead of the host zone.
    #[arg(long, value_parser = DisplayZone::parse)]
    utc_offset: Option<DisplayZone>,
}

#[derive(Debug, Args)]
struct CallsToCsvArgs {
    db_file: PathBuf,
    #[arg(short, long, default_value = "call_logs.csv")]
    output: PathBuf,
    /// Own phone number used for WhatsApp subscription ids; prompted for when absent.
    #[arg(long)]
    self_number: Option<String>,
    #[command(flatten)]
    display: DisplayArgs,
}

#[derive(Debug, Args)]
struct CallsToXmlArgs {
    csv_file: PathBuf,
    #[arg(short, long, default_value = "call_logs.xml")]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct SmsToCsvArgs {
    db_file: PathBuf,
    /// Output file stem; `.csv` is appended.
    #[arg(short, long, default_value = "messages")]
    output: PathBuf,
    /// Prior messages backup; only messages newer than its latest `date` are exported.
    #[arg(short = 'x', long = "xml", conflicts_with = "cutoff")]
    xml: Option<PathBuf>,
    /// Export only messages after this Unix millisecond timestamp (`-1` for all).
    #[arg(long, allow_negative_numbers = true, value_parser = Cutoff::parse_input)]
    cutoff: Option<Cutoff>,
    #[arg(long, default_value = "+91")]
    country_prefix: String,
    #[arg(long, default_value_t = 13)]
    short_number_limit: usize,
    #[command(flatten)]
    display: DisplayArgs,
}

#[derive(Debug, Args)]
struct SmsToXmlArgs {
    csv_file: PathBuf,
    #[arg(short, long, default_value = "output.xml")]
    output: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            println!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_directives = if verbose { "warn,logbridge=debug" } else { "warn,logbridge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stdout).with_target(false).init();
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::CallsToCsv(args) => run_calls_to_csv(args),
        Command::CallsToXml(args) => run_calls_to_xml(&args),
        Command::SmsToCsv(args) => run_sms_to_csv(args),
        Command::SmsToXml(args) => run_sms_to_xml(&args),
    }
}

fn run_calls_to_csv(args: CallsToCsvArgs) -> Result<()> {
    let self_number = match args.self_number {
        Some(number) => number.trim().to_string(),
        None => prompt_line(&mut io::stdin().lock(), &mut io::stdout(), SELF_NUMBER_PROMPT)?,
    };
    let config = RunConfig {
        self_number,
        display_zone: resolve_display_zone(args.display.utc_offset),
        counterparty: CounterpartyRules::default(),
    };

    let result = LogBridgeApi::new(config).export_calls(&args.db_file, &args.output)?;
    match result.staging {
        None => println!("No call logs to write."),
        Some(staging) => {
            println!("Call logs successfully written to {}, sorted by date.", staging.path.display());
            println!("Rows written: {}", staging.rows);
            println!("SHA-256: {}", staging.sha256);
        }
    }
    Ok(())
}

fn run_sms_to_csv(args: SmsToCsvArgs) -> Result<()> {
    let config = RunConfig {
        self_number: String::new(),
        display_zone: resolve_display_zone(args.display.utc_offset),
        counterparty: CounterpartyRules {
            country_prefix: args.country_prefix,
            short_number_limit: args.short_number_limit,
            ..CounterpartyRules::default()
        },
    };
    let api = LogBridgeApi::new(config);
    let output = staging_path(&args.output);

    let result = api.export_messages(&args.db_file, &output, || match (&args.xml, args.cutoff) {
        (Some(xml), _) => {
            let prior = api.cutoff_from_backup(xml);
            report_prior_backup(&prior);
            Ok(prior.cutoff())
        }
        (None, Some(cutoff)) => Ok(cutoff),
        (None, None) => prompt_cutoff(&mut io::stdin().lock(), &mut io::stdout()),
    })?;

    match result.staging {
        None => println!("No messages to write."),
        Some(staging) => {
            println!(
                "Messages successfully written to {}, deduplicated, sorted, and filtered.",
                staging.path.display()
            );
            println!("Total rows: {}", result.stats.total);
            println!("Rows written: {}", result.stats.written);
            println!("Rows not written: {}", result.stats.skipped);
            println!("SHA-256: {}", staging.sha256);
        }
    }
    Ok(())
}

fn report_prior_backup(prior: &PriorBackup) {
    match prior {
        PriorBackup::Latest { date_ms, display } => println!("Taking the cutoff as: {date_ms}, i.e: {display}"),
        PriorBackup::NoDatedMessages => println!("No dated messages in the XML file; writing all rows."),
        PriorBackup::Unreadable(reason) => {
            println!("Error: {reason}");
            println!("Using default behavior (writing all rows) due to XML error.");
        }
    }
}

fn run_calls_to_xml(args: &CallsToXmlArgs) -> Result<()> {
    let result = xml_api().calls_to_xml(&args.csv_file, &args.output)?;
    report_conversion(&args.csv_file, result.target.is_some(), &args.output);
    Ok(())
}

fn run_sms_to_xml(args: &SmsToXmlArgs) -> Result<()> {
    let result = xml_api().messages_to_xml(&args.csv_file, &args.output)?;
    report_conversion(&args.csv_file, result.target.is_some(), &args.output);
    Ok(())
}

fn xml_api() -> LogBridgeApi {
    LogBridgeApi::new(RunConfig::default())
}

fn report_conversion(csv_file: &Path, written: bool, output: &Path) {
    if written {
        println!("Successfully converted '{}' to '{}'", csv_file.display(), output.display());
    } else {
        println!("CSV file is empty. No XML generated.");
    }
}

/// Append `.csv` to the output stem unless it already carries that extension.
fn staging_path(stem: &Path) -> PathBuf {
    let already_csv = stem
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("csv"));
    if already_csv {
        return stem.to_path_buf();
    }
    let mut name = stem.as_os_str().to_os_string();
    name.push(".csv");
    PathBuf::from(name)
}

fn resolve_display_zone(requested: Option<DisplayZone>) -> DisplayZone {
    if let Some(zone) = requested {
        return zone;
    }
    if UtcOffset::current_local_offset().is_err() {
        tracing::warn!("local UTC offset unavailable; readable dates are rendered in UTC");
        return DisplayZone::utc();
    }
    DisplayZone::Local
}

fn prompt_line(input: &mut impl BufRead, output: &mut impl Write, prompt: &str) -> Result<String> {
    write!(output, "{prompt}").context("failed to write prompt")?;
    output.flush().context("failed to flush prompt")?;

    let mut line = String::new();
    input.read_line(&mut line).context("failed to read from stdin")?;
    Ok(line.trim().to_string())
}

/// Ask until the operator enters an integer timestamp or nothing. End of input counts as
/// nothing.
fn prompt_cutoff(input: &mut impl BufRead, output: &mut impl Write) -> Result<Cutoff> {
    loop {
        write!(output, "{CUTOFF_PROMPT}").context("failed to write prompt")?;
        output.flush().context("failed to flush prompt")?;

        let mut line = String::new();
        let read = input.read_line(&mut line).context("failed to read from stdin")?;
        if read == 0 {
            return Ok(Cutoff::Unbounded);
        }
        match Cutoff::parse_input(&line) {
            Ok(cutoff) => return Ok(cutoff),
            Err(_) => writeln!(output, "{CUTOFF_RETRY}").context("failed to write prompt")?,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn cutoff_prompt_retries_until_numeric() -> Result<()> {
        let mut input = Cursor::new("yesterday\n1704121445600\n");
        let mut output = Vec::new();
        let cutoff = prompt_cutoff(&mut input, &mut output)?;

        assert_eq!(cutoff, Cutoff::After(1_704_121_446_000));
        let shown = String::from_utf8_lossy(&output);
        assert_eq!(shown.matches(CUTOFF_RETRY).count(), 1);
        assert_eq!(shown.matches(CUTOFF_PROMPT).count(), 2);
        Ok(())
    }

    #[test]
    fn cutoff_prompt_blank_or_closed_input_means_all_rows() -> Result<()> {
        assert_eq!(prompt_cutoff(&mut Cursor::new("\n"), &mut Vec::new())?, Cutoff::Unbounded);
        assert_eq!(prompt_cutoff(&mut Cursor::new(""), &mut Vec::new())?, Cutoff::Unbounded);
        Ok(())
    }

    #[test]
    fn self_number_prompt_trims_input() -> Result<()> {
        let number = prompt_line(&mut Cursor::new(" 15550001111 \n"), &mut Vec::new(), SELF_NUMBER_PROMPT)?;
        assert_eq!(number, "15550001111");
        Ok(())
    }

    #[test]
    fn staging_path_appends_extension_once() {
        assert_eq!(staging_path(Path::new("messages")), PathBuf::from("messages.csv"));
        assert_eq!(staging_path(Path::new("out/backup.v2")), PathBuf::from("out/backup.v2.csv"));
        assert_eq!(staging_path(Path::new("messages.csv")), PathBuf::from("messages.csv"));
    }

    #[test]
    fn explicit_offset_wins_over_host_zone() {
        assert_eq!(resolve_display_zone(Some(DisplayZone::utc())), DisplayZone::utc());
    }

    #[test]
    fn cli_rejects_xml_together_with_cutoff() {
        let parsed = Cli::try_parse_from(["logbridge", "sms-to-csv", "chat.db", "-x", "prior.xml", "--cutoff", "5"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["logbridge", "sms-to-csv", "chat.db", "--cutoff", "-1"])
            .unwrap_or_else(|err| panic!("negative sentinel should parse: {err}"));
        match parsed.command {
            Command::SmsToCsv(args) => assert_eq!(args.cutoff, Some(Cutoff::Unbounded)),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
