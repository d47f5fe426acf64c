use std::io::{Read as _, Write as _};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use sgw_core::{
    config_schema_json, load_config, Completion, Config, GatewayClient, LongRunningState,
    RemoteDataInterface, RemoteReply, ReplyPayload, TaskParams,
};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "sgw", version, about = "Science gateway remote files and jobs")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(flatten)]
    login: LoginArgs,
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct LoginArgs {
    #[arg(long, env = "SGW_USERNAME", global = true)]
    user: Option<String>,
    #[arg(long, env = "SGW_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List a remote directory
    Ls { path: Option<String> },
    /// Delete a remote file or directory
    Rm { path: String },
    /// Move a remote entry
    Mv { from: String, to: String },
    /// Copy a remote entry
    Cp { from: String, to: String },
    /// Rename a remote entry in place
    Rename { path: String, new_name: String },
    /// Create a directory under PARENT
    Mkdir { parent: String, name: String },
    /// Upload a local file into a remote directory
    Upload { local: String, remote_dir: String },
    /// Store stdin as a remote file
    PutBuffer { remote_path: String },
    /// Download a remote file to a local path
    Download { remote_path: String, local: String },
    /// Write a remote file to stdout
    Cat { remote_path: String },
    /// Submit a job
    Run(RunArgs),
    /// Show a job document by id
    Job { id: String },
    /// Print the configuration JSON schema
    Schema,
}

#[derive(Args)]
struct RunArgs {
    /// Application id to run
    app: String,
    /// Job parameter NAME=VALUE (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// Remote working directory handed to the job
    #[arg(long, default_value = ".")]
    workdir: String,
    /// Poll until the job settles
    #[arg(long)]
    watch: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty parameter name in {raw:?}"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn main() {
    sgw_otel::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            2
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    if matches!(cli.command, Commands::Schema) {
        print_json(&config_schema_json(), true);
        return Ok(0);
    }
    let config = match cli.config.as_deref() {
        Some(path) => load_config(path)?,
        None => {
            let mut cfg = Config::default();
            cfg.apply_env_overrides()?;
            cfg
        }
    };
    // One thread drives every reply; completions never run concurrently.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(session(config, cli))
}

async fn session(config: Config, cli: Cli) -> Result<i32> {
    let (Some(user), Some(password)) = (cli.login.user.as_deref(), cli.login.password.as_deref())
    else {
        bail!("credentials required: pass --user/--password or set SGW_USERNAME/SGW_PASSWORD");
    };
    let client = GatewayClient::connect(config)?;

    let auth = client.authenticate(user, password)?.wait().await;
    if !auth.is_good() {
        print_json(&completion_json(&auth), cli.pretty);
        return Ok(1);
    }
    debug!(user, "session open");

    let code = execute(&client, cli.command, cli.pretty).await?;

    let closed = client.close_all_connections()?.wait().await;
    if !closed.is_good() {
        info!(
            error = closed.error_text.as_deref().unwrap_or_default(),
            "token revocation failed"
        );
    }
    Ok(code)
}

async fn execute(client: &GatewayClient, command: Commands, pretty: bool) -> Result<i32> {
    let reply = match command {
        Commands::Ls { path } => client.list_directory(path.as_deref().unwrap_or("."))?,
        Commands::Rm { path } => client.delete_entry(&path)?,
        Commands::Mv { from, to } => client.move_entry(&from, &to)?,
        Commands::Cp { from, to } => client.copy_entry(&from, &to)?,
        Commands::Rename { path, new_name } => client.rename_entry(&path, &new_name)?,
        Commands::Mkdir { parent, name } => client.make_directory(&parent, &name)?,
        Commands::Upload { local, remote_dir } => client.upload_file(&remote_dir, &local)?,
        Commands::PutBuffer { remote_path } => {
            let mut bytes = Vec::new();
            std::io::stdin()
                .read_to_end(&mut bytes)
                .context("reading stdin")?;
            client.upload_buffer(&remote_path, bytes)?
        }
        Commands::Download { remote_path, local } => client.download_file(&local, &remote_path)?,
        Commands::Cat { remote_path } => {
            let done = client.download_buffer(&remote_path)?.wait().await;
            if let ReplyPayload::Buffer(bytes) = &done.payload {
                let mut out = std::io::stdout().lock();
                out.write_all(bytes).context("writing stdout")?;
                out.flush().ok();
                return Ok(0);
            }
            print_json(&completion_json(&done), pretty);
            return Ok(1);
        }
        Commands::Run(args) => return run_job(client, args, pretty).await,
        Commands::Job { id } => client.job_details(&id)?,
        Commands::Schema => {
            print_json(&config_schema_json(), true);
            return Ok(0);
        }
    };
    Ok(report(&reply, pretty).await)
}

async fn report(reply: &RemoteReply, pretty: bool) -> i32 {
    let done = reply.wait().await;
    print_json(&completion_json(&done), pretty);
    exit_code(&done)
}

async fn run_job(client: &GatewayClient, args: RunArgs, pretty: bool) -> Result<i32> {
    let params: TaskParams = args.params.into_iter().collect();
    let reply = client.run_job(&args.app, params, &args.workdir)?;
    let done = reply.wait().await;
    print_json(&completion_json(&done), pretty);
    if !done.is_good() || !args.watch {
        return Ok(exit_code(&done));
    }
    let Some(task) = reply.long_running_ref(true) else {
        bail!("job accepted without a task id");
    };
    let mut changes = task.subscribe();
    let poller = client.start_task_polling(None)?;
    while !task.state().is_terminal() {
        match changes.recv().await {
            Ok(change) => print_json(&json!(change), pretty),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    poller.abort();
    print_json(&task.summary(), pretty);
    Ok(if task.state() == LongRunningState::Done {
        0
    } else {
        1
    })
}

fn completion_json(done: &Completion) -> Value {
    match &done.payload {
        // Raw bytes render as a length; `cat` streams them instead.
        ReplyPayload::Buffer(bytes) => json!({
            "kind": done.kind,
            "state": done.state,
            "payload": {"type": "buffer", "len": bytes.len()},
            "error_text": done.error_text,
        }),
        _ => serde_json::to_value(done).unwrap_or_else(|_| json!({"state": done.state})),
    }
}

fn exit_code(done: &Completion) -> i32 {
    if done.is_good() {
        0
    } else {
        1
    }
}

fn print_json(value: &Value, pretty: bool) {
    if pretty {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    } else {
        println!("{value}");
    }
}
