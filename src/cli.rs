use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use scorekeep::config::Config;
use scorekeep::error::ErrorCode;
use scorekeep::model::{Caller, CredentialSource, GroupKey, JobInput, SubjectRef};
use scorekeep::store::{RecordStore, SqliteStore, UsageSink};
use scorekeep::streaming::{EventSource, SessionStatus, StreamConsumer, StreamSession};
use scorekeep::transport::{SubprocessSource, TcpSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Where `serve` listens and `run` connects by default.
pub const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:7878";

#[derive(Parser, Debug)]
#[command(name = "scorekeep")]
#[command(about = "Run analysis jobs and keep every result as a numbered version", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (default: <config dir>/scorekeep/config.toml)
    #[arg(long, global = true, env = "SCOREKEEP_CONFIG")]
    pub config: Option<PathBuf>,

    /// More log output (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Serve one job over stdin/stdout (used by `run --local`)
    #[arg(long, hide = true)]
    pub server: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn verbosity(&self) -> i8 {
        if self.quiet {
            -1
        } else {
            self.verbose.min(i8::MAX as u8) as i8
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept jobs over TCP until interrupted
    Serve {
        /// Address to listen on
        #[arg(long, default_value = DEFAULT_DAEMON_ADDR)]
        listen: String,
    },

    /// Run one job and stream its progress
    Run {
        #[command(flatten)]
        group: GroupArgs,

        /// Caller IP, counted against the per-IP limit
        #[arg(long)]
        ip: Option<String>,

        /// Installation id, counted against the per-installation limit
        #[arg(long)]
        installation: Option<String>,

        /// Whose credentials pay for the producer call
        #[arg(long, default_value = "pooled", value_parser = parse_credentials)]
        credentials: CredentialSource,

        /// Address of the `scorekeep serve` daemon that runs the job
        #[arg(long, default_value = DEFAULT_DAEMON_ADDR)]
        connect: String,

        /// Run the job in a child process instead of the daemon. Admission
        /// limits are not enforced across local runs.
        #[arg(long, conflicts_with = "connect")]
        local: bool,

        /// On a generation failure, retry once with the failure as context
        #[arg(long)]
        retry_on_failure: bool,

        /// Print the final result as JSON only
        #[arg(long)]
        json: bool,
    },

    /// List stored versions for a group
    Versions {
        #[command(flatten)]
        group: GroupArgs,
    },

    /// Print one stored result (latest by default)
    Show {
        #[command(flatten)]
        group: GroupArgs,

        #[arg(long)]
        version: Option<u32>,
    },

    /// Metered usage for a subject
    Usage {
        /// Subject as OWNER/NAME
        #[arg(long)]
        subject: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct GroupArgs {
    /// Owning user id
    #[arg(long, env = "SCOREKEEP_USER")]
    pub user: String,

    /// Subject as OWNER/NAME
    #[arg(long)]
    pub subject: String,

    /// Git ref of the subject
    #[arg(long = "ref", default_value = "main")]
    pub git_ref: String,

    /// Analysis feature
    #[arg(long)]
    pub feature: String,
}

impl GroupArgs {
    fn subject_ref(&self) -> Result<SubjectRef> {
        let (owner, name) = split_subject(&self.subject)?;
        Ok(SubjectRef::new(owner, name, self.git_ref.clone()))
    }

    fn group_key(&self) -> Result<GroupKey> {
        Ok(GroupKey::new(self.user.clone(), self.subject_ref()?, self.feature.clone()))
    }
}

fn split_subject(subject: &str) -> Result<(&str, &str)> {
    subject
        .split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'))
        .with_context(|| format!("Subject must look like OWNER/NAME, got {:?}", subject))
}

fn parse_credentials(s: &str) -> Result<CredentialSource, String> {
    CredentialSource::parse(s).ok_or_else(|| format!("expected pooled or caller_supplied, got {:?}", s))
}

pub async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load(cli.config.as_deref())?;

    if cli.server {
        let driver = scorekeep::server::build_driver(&config)?;
        scorekeep::server::run_stdio(driver).await?;
        return Ok(true);
    }

    let Some(command) = cli.command else {
        anyhow::bail!("No command given. Try `scorekeep --help`.");
    };

    match command {
        Command::Serve { listen } => {
            let driver = scorekeep::server::build_driver(&config)?;
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("Failed to listen on {}", listen))?;
            eprintln!("{} {}", "Listening on".green(), listener.local_addr()?);
            scorekeep::server::run_tcp(driver, listener, config.admission.sweep_interval()).await?;
            Ok(true)
        }

        Command::Run {
            group,
            ip,
            installation,
            credentials,
            connect,
            local,
            retry_on_failure,
            json,
        } => {
            let caller = Caller {
                user_id: group.user.clone(),
                ip,
                installation_id: installation,
                credentials,
            };
            let input = JobInput::new(group.subject_ref()?, group.feature.clone());
            let source: Arc<dyn EventSource> = if local {
                tracing::warn!("local run: admission limits only apply to jobs sent to `scorekeep serve`");
                Arc::new(SubprocessSource::current_exe(cli.config.clone(), caller))
            } else {
                Arc::new(TcpSource::new(connect.clone(), caller))
            };
            let consumer = StreamConsumer::new(source).with_idle_timeout(config.idle_timeout());
            let daemon = (!local).then_some(connect.as_str());
            run_job(consumer, input, retry_on_failure, json, daemon).await
        }

        Command::Versions { group } => {
            let store = open_store(&config)?;
            let key = group.group_key()?;
            let versions = store.list_versions(&key).await?;
            if versions.is_empty() {
                println!("No versions for {}", key);
                return Ok(true);
            }
            println!("{}", key.to_string().bold());
            for summary in versions {
                println!(
                    "  {:>4}  {}",
                    format!("v{}", summary.version).cyan(),
                    summary.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            Ok(true)
        }

        Command::Show { group, version } => {
            let store = open_store(&config)?;
            let key = group.group_key()?;
            match store.get_version(&key, version).await? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record.payload)?);
                    Ok(true)
                }
                None => {
                    eprintln!("{} no stored result for {}", "error:".red().bold(), key);
                    Ok(false)
                }
            }
        }

        Command::Usage { subject } => {
            let (owner, name) = split_subject(&subject)?;
            let store = open_store(&config)?;
            let totals = store.usage_totals(&format!("{}/{}", owner, name)).await?;
            println!("{}", subject.bold());
            println!("  runs           {}", totals.runs);
            println!("  input units    {}", totals.input_units);
            println!("  output units   {}", totals.output_units);
            println!("  total units    {}", totals.total_units);
            Ok(true)
        }
    }
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    let path = config.database_path();
    SqliteStore::open(&path).with_context(|| format!("Failed to open {}", path.display()))
}

fn progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Drive `consumer` to a result, retrying once on a generation failure when asked.
async fn run_job(
    mut consumer: StreamConsumer,
    input: JobInput,
    retry_on_failure: bool,
    json: bool,
    daemon: Option<&str>,
) -> Result<bool> {
    let pb = progress_bar(json);
    let mut retried = false;
    consumer.start(input);

    loop {
        while consumer.next_update().await.is_some() {
            render(&pb, consumer.session());
        }

        let session = consumer.session();
        match session.status {
            SessionStatus::Complete => {
                pb.finish_and_clear();
                print_result(session, json)?;
                return Ok(true);
            }
            SessionStatus::Error
                if retry_on_failure
                    && !retried
                    && session.error_code == Some(ErrorCode::GenerationFailed) =>
            {
                pb.println(format!(
                    "{} {}",
                    "Attempt failed, retrying:".yellow(),
                    session.error.as_deref().unwrap_or("unknown error")
                ));
                let prior_result = session.last_good_result.clone();
                let prior_error = session.error.clone();
                consumer.retry(prior_result, prior_error)?;
                retried = true;
            }
            _ => {
                pb.finish_and_clear();
                eprintln!(
                    "{} {}",
                    "error:".red().bold(),
                    session.error.as_deref().unwrap_or("job did not finish")
                );
                if let (Some(addr), Some(ErrorCode::Transport)) = (daemon, session.error_code) {
                    eprintln!(
                        "  is `scorekeep serve` listening on {}? Use --local to run without the daemon.",
                        addr
                    );
                }
                return Ok(false);
            }
        }
    }
}

fn render(pb: &ProgressBar, session: &StreamSession) {
    pb.set_position(session.percent as u64);
    pb.set_message(session.message.clone());
}

fn print_result(session: &StreamSession, json: bool) -> Result<()> {
    let result = session.result.clone().unwrap_or_default();
    if json {
        println!("{}", serde_json::to_string(&result)?);
        return Ok(());
    }

    if let Some(version) = session.version {
        println!("{} version {}", "✓ Saved".green().bold(), version);
    }
    if let Some(usage) = session.usage {
        println!(
            "  {} in / {} out ({} total units)",
            usage.input_units, usage.output_units, usage.total_units
        );
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
