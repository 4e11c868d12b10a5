#[macro_use]
extern crate tracing;

use cert_manager_webhook_httpreq::{
    challenge::{
        ChallengeAction,
        ChallengeRequest,
    },
    config::{
        load_issuer_config_file,
        IssuerConfig,
    },
    dns::lookup::wait_for_txt_record,
    mock::MockHttpReqEndpoint,
    solver::{
        HttpReqSolver,
        Solver as _,
        SolverArgs,
    },
};
use clap::Parser;
use eyre::{
    bail,
    Result,
};
use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

const UID_CHARSET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Parser)]
#[command(version, about)]
enum Args {
    /// Print the JSON schema of the issuer solver config
    Schema,
    /// Run the mock httpreq endpoint and its DNS server until interrupted
    Mock(ArgsMock),
    /// Present a challenge record through the configured endpoint
    Present(ArgsChallenge),
    /// Clean up a challenge record through the configured endpoint
    Cleanup(ArgsChallenge),
}

#[derive(Parser)]
struct ArgsMock {
    #[clap(long, env = "MOCK_HTTP_ADDR", default_value = "127.0.0.1:0")]
    http_addr: SocketAddr,

    #[clap(long, env = "MOCK_DNS_ADDR", default_value = "127.0.0.1:0")]
    dns_addr: SocketAddr,
}

#[derive(Parser)]
struct ArgsChallenge {
    #[clap(flatten)]
    solver: SolverArgs,

    #[clap(long, help = "Fully qualified record name, e.g. _acme-challenge.example.com.")]
    fqdn: String,

    #[clap(long, help = "TXT record value")]
    key: String,

    #[clap(long, default_value = "default", help = "Namespace used for header secret lookups")]
    namespace: String,

    #[clap(
        long,
        env = "TEST_CONFIG_FILE",
        conflicts_with = "endpoint",
        help = "Issuer config JSON file"
    )]
    config: Option<PathBuf>,

    #[clap(long, help = "Endpoint base URL, used instead of --config")]
    endpoint: Option<String>,

    #[clap(long, help = "Enable header secrets using the ambient kube config")]
    kube: bool,

    #[clap(
        long,
        value_parser = humantime::parse_duration,
        help = "After presenting, wait up to this long for the TXT record to resolve"
    )]
    wait: Option<Duration>,

    #[clap(long, default_value = "127.0.0.1:53", help = "Nameserver used with --wait")]
    nameserver: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().expect("color_eyre init");
    tracing_subscriber::fmt::init();

    match Args::parse() {
        Args::Schema => {
            let schema = schemars::schema_for!(IssuerConfig);
            let yaml = serde_yaml::to_string(&schema)?;
            print!("{yaml}")
        }
        Args::Mock(args) => {
            run_mock(args).await?;
        }
        Args::Present(args) => {
            run_challenge(ChallengeAction::Present, args).await?;
        }
        Args::Cleanup(args) => {
            run_challenge(ChallengeAction::CleanUp, args).await?;
        }
    }

    Ok(())
}

async fn run_mock(ArgsMock { http_addr, dns_addr }: ArgsMock) -> Result<()> {
    let mut endpoint = MockHttpReqEndpoint::bind(http_addr, dns_addr).await?;

    println!("endpoint: {}", endpoint.url());
    println!("dns:      {}", endpoint.dns().addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down mock endpoint");
    endpoint.close().await?;

    Ok(())
}

async fn run_challenge(action: ChallengeAction, args: ArgsChallenge) -> Result<()> {
    let issuer_config = match (&args.config, &args.endpoint) {
        (Some(path), _) => load_issuer_config_file(path)?,
        (None, Some(endpoint)) => IssuerConfig {
            endpoint: endpoint.clone(),
            ..Default::default()
        },
        (None, None) => bail!("either --config or --endpoint is required"),
    };

    let mut solver = HttpReqSolver::new(&args.solver)?;
    let kube_config = if args.kube {
        Some(kube::Config::infer().await?)
    } else {
        None
    };
    let stop = CancellationToken::new();
    solver.initialize(kube_config, stop.clone()).await?;

    let mut ch = ChallengeRequest::new(
        action.clone(),
        &args.fqdn,
        &args.key,
        Some(serde_json::to_value(&issuer_config)?),
    );
    ch.uid = random_string::generate(12, UID_CHARSET);
    ch.resource_namespace = args.namespace.clone();

    debug!(uid = %ch.uid, %action, "running challenge");

    match action {
        ChallengeAction::Present => {
            solver.present(ch).await?;
            if let Some(wait) = args.wait {
                wait_for_txt_record(
                    args.nameserver,
                    &args.fqdn,
                    &args.key,
                    Some(wait),
                    Duration::from_millis(200),
                )
                .await?;
            }
        }
        ChallengeAction::CleanUp => solver.clean_up(ch).await?,
        ChallengeAction::Other(other) => bail!("unsupported action {other:?}"),
    }

    stop.cancel();
    Ok(())
}
