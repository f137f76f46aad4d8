use std::{collections::BTreeMap, sync::Arc};

use {
    anyhow::{Result, bail},
    cadence_config::CadenceConfig,
    cadence_scheduler::{
        Error,
        executor::JobExecutor,
        schedule::ScheduleSpec,
        service::Scheduler,
        types::{Job, JobCreate, JobKind, JobStat, RemoteProperties},
    },
    chrono::{SecondsFormat, Utc},
    clap::Args,
    tracing::info,
};

use crate::storage;

#[derive(Args)]
pub struct AddArgs {
    /// Human-readable job name.
    #[arg(long)]
    name: String,
    /// Shell command to run with `sh -c`.
    #[arg(long, conflicts_with = "url", required_unless_present = "url")]
    command: Option<String>,
    /// URL to call instead of running a command.
    #[arg(long)]
    url: Option<String>,
    /// HTTP method for remote jobs.
    #[arg(long, default_value = "GET", requires = "url")]
    method: String,
    /// Request header as `name:value`. Repeatable.
    #[arg(long = "header", requires = "url")]
    headers: Vec<String>,
    /// Request body for remote jobs.
    #[arg(long, requires = "url")]
    body: Option<String>,
    /// Request timeout in seconds for remote jobs.
    #[arg(long, requires = "url")]
    timeout_secs: Option<u64>,
    /// Status code counted as success. Repeatable; default is any 2xx.
    #[arg(long = "expect", requires = "url")]
    expected_response_codes: Vec<u16>,
    /// Schedule as `R<n>/<start>/<interval>`. Omit to run once, immediately.
    #[arg(long)]
    schedule: Option<String>,
    /// Extra attempts after a failed run.
    #[arg(long, default_value_t = 0)]
    retries: u32,
    #[arg(long, default_value = "")]
    owner: String,
    /// Job id; a UUID is generated when omitted.
    #[arg(long)]
    id: Option<String>,
    /// Store the job without arming it.
    #[arg(long)]
    disabled: bool,
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("header must be `name:value`, got `{raw}`");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("header name must not be empty in `{raw}`");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

impl AddArgs {
    fn into_create(self) -> Result<JobCreate> {
        let kind = match (self.command, self.url) {
            (Some(command), None) => JobKind::Local { command },
            (None, Some(url)) => {
                let headers = self
                    .headers
                    .iter()
                    .map(|h| parse_header(h))
                    .collect::<Result<BTreeMap<_, _>>>()?;
                JobKind::Remote(RemoteProperties {
                    url,
                    method: self.method,
                    headers,
                    body: self.body,
                    timeout_secs: self.timeout_secs,
                    expected_response_codes: self.expected_response_codes,
                })
            },
            _ => bail!("exactly one of --command or --url is required"),
        };
        Ok(JobCreate {
            id: self.id,
            name: self.name,
            owner: self.owner,
            kind,
            schedule: self.schedule,
            retries: self.retries,
            disabled: self.disabled,
        })
    }
}

/// Run the scheduler until Ctrl-C.
pub async fn run_daemon(config: &CadenceConfig) -> Result<()> {
    for d in cadence_config::validate::validate(config).diagnostics {
        if d.severity == cadence_config::Severity::Error {
            bail!("invalid config: {}: {}", d.path, d.message);
        }
    }

    let stores = storage::open(config).await?;
    let executor = Arc::new(JobExecutor::new(&config.remote)?);
    let scheduler = Scheduler::new(stores.jobs, stores.runs, executor, &config.scheduler);
    scheduler.start().await?;

    let stats = scheduler.stats();
    info!(
        jobs = stats.jobs,
        active = stats.active_jobs,
        next_run_at = ?stats.next_run_at,
        "scheduler running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler.stop().await?;
    Ok(())
}

pub fn preview(spec: &str, count: usize) -> Result<()> {
    let spec: ScheduleSpec = spec.parse()?;
    println!("{spec}");
    let occurrences = spec.preview(Utc::now(), count);
    if occurrences.is_empty() {
        println!("  (no occurrences)");
    }
    for (i, at) in occurrences.iter().enumerate() {
        println!("  {:>3}. {}", i + 1, at.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    Ok(())
}

pub async fn add(config: &CadenceConfig, args: AddArgs) -> Result<()> {
    let job = Job::from_create(args.into_create()?, Utc::now())?;
    let stores = storage::open(config).await?;
    match stores.jobs.get(&job.id).await {
        Ok(_) => return Err(Error::duplicate_job(&job.id).into()),
        Err(Error::JobNotFound { .. }) => {},
        Err(e) => return Err(e.into()),
    }
    stores.jobs.save(&job).await?;
    stores.jobs.close().await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

fn describe_kind(kind: &JobKind) -> String {
    match kind {
        JobKind::Local { command } => format!("$ {command}"),
        JobKind::Remote(props) => format!("{} {}", props.method.to_uppercase(), props.url),
    }
}

fn format_time(at: Option<chrono::DateTime<Utc>>) -> String {
    at.map_or_else(|| "-".into(), |t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub async fn list_jobs(config: &CadenceConfig, json: bool) -> Result<()> {
    let stores = storage::open(config).await?;
    let mut jobs = stores.jobs.get_all().await?;
    stores.jobs.close().await?;
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    for job in &jobs {
        let status = if job.state.finished {
            "finished"
        } else if job.disabled {
            "disabled"
        } else {
            "active"
        };
        println!(
            "{}  {} [{status}] next={} ok={} err={}",
            job.id,
            job.name,
            format_time(job.state.next_run_at),
            job.metadata.success_count,
            job.metadata.error_count,
        );
        println!("    {}", describe_kind(&job.kind));
        if let Some(schedule) = &job.schedule {
            println!("    schedule: {schedule}");
        }
    }
    Ok(())
}

fn describe_run(run: &JobStat) -> String {
    let duration = run
        .duration_ms
        .map_or_else(String::new, |ms| format!(" ({ms}ms)"));
    let detail = run
        .error
        .as_deref()
        .or(run.output.as_deref())
        .map_or_else(String::new, |d| format!(" {d}"));
    format!(
        "{} {} retries={}{duration}{detail}",
        run.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        run.status.as_str(),
        run.retries,
    )
}

pub async fn list_runs(config: &CadenceConfig, job_id: &str, json: bool) -> Result<()> {
    let stores = storage::open(config).await?;
    let runs = stores.runs.get_all_runs(job_id).await?;
    stores.jobs.close().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
    } else if runs.is_empty() {
        println!("No runs for {job_id}.");
    } else {
        for run in &runs {
            println!("{}", describe_run(run));
        }
    }
    Ok(())
}

pub async fn purge_runs(config: &CadenceConfig, job: Option<&str>) -> Result<()> {
    let stores = storage::open(config).await?;
    match job {
        Some(job_id) => {
            stores.runs.delete_runs(job_id).await?;
            println!("Removed all runs of {job_id}.");
        },
        None => {
            if config.runs.retention_days.is_none() {
                println!("runs.retention_days is not set; nothing to purge.");
            } else {
                let removed = stores.runs.clear_expired_runs().await?;
                println!("Removed {removed} expired run(s).");
            }
        },
    }
    stores.jobs.close().await?;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        cadence_config::StorageBackend,
        cadence_scheduler::types::RunStatus,
        clap::Parser,
    };

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        add: AddArgs,
    }

    fn parse(args: &[&str]) -> Result<JobCreate> {
        let cli = TestCli::try_parse_from(std::iter::once("add").chain(args.iter().copied()))?;
        cli.add.into_create()
    }

    fn file_config(dir: &std::path::Path) -> CadenceConfig {
        let mut config = CadenceConfig::default();
        config.storage.backend = StorageBackend::File;
        config.storage.path = Some(dir.to_path_buf());
        config
    }

    #[test]
    fn add_local_job() {
        let create = parse(&["--name", "backup", "--command", "tar czf /tmp/b.tgz /etc"]).unwrap();
        assert!(matches!(create.kind, JobKind::Local { .. }));
        assert_eq!(create.retries, 0);
    }

    #[test]
    fn add_remote_job_with_headers() {
        let create = parse(&[
            "--name",
            "ping",
            "--url",
            "https://example.com/hook",
            "--method",
            "POST",
            "--header",
            "Authorization: Bearer x",
            "--expect",
            "202",
        ])
        .unwrap();
        let JobKind::Remote(props) = create.kind else {
            panic!("expected remote job");
        };
        assert_eq!(props.method, "POST");
        assert_eq!(props.headers["Authorization"], "Bearer x");
        assert_eq!(props.expected_response_codes, vec![202]);
    }

    #[test]
    fn add_requires_command_or_url() {
        assert!(parse(&["--name", "nothing"]).is_err());
        assert!(
            parse(&[
                "--name",
                "both",
                "--command",
                "true",
                "--url",
                "http://x"
            ])
            .is_err()
        );
    }

    #[test]
    fn header_without_colon_rejected() {
        assert!(parse_header("nocolon").is_err());
        assert!(parse_header(": value").is_err());
        assert_eq!(
            parse_header("X-Token: abc").unwrap(),
            ("X-Token".to_string(), "abc".to_string())
        );
    }

    #[test]
    fn preview_rejects_malformed_spec() {
        assert!(preview("R2/yesterday/P1D", 3).is_err());
        preview("R2/2030-01-01T00:00:00Z/P1D", 3).unwrap();
    }

    #[tokio::test]
    async fn add_then_list_and_purge() {
        let tmp = tempfile::tempdir().unwrap();
        let config = file_config(tmp.path());

        let args = TestCli::try_parse_from([
            "add", "--name", "nightly", "--command", "true", "--id", "nightly",
        ])
        .unwrap()
        .add;
        add(&config, args).await.unwrap();

        let duplicate = TestCli::try_parse_from([
            "add", "--name", "nightly", "--command", "true", "--id", "nightly",
        ])
        .unwrap()
        .add;
        assert!(add(&config, duplicate).await.is_err());

        let stores = storage::open(&config).await.unwrap();
        assert_eq!(stores.jobs.get("nightly").await.unwrap().name, "nightly");

        let mut run = JobStat::start("nightly", Utc::now());
        run.finish(Utc::now(), Ok(None));
        stores.runs.save_run(&run).await.unwrap();
        assert_eq!(
            stores.runs.get_all_runs("nightly").await.unwrap()[0].status,
            RunStatus::Succeeded
        );

        list_jobs(&config, false).await.unwrap();
        list_runs(&config, "nightly", true).await.unwrap();
        purge_runs(&config, Some("nightly")).await.unwrap();
        assert!(stores.runs.get_all_runs("nightly").await.unwrap().is_empty());
    }
}
