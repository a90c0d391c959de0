use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use commonware_runtime::{tokio, Metrics, Runner, Spawner};
use orebot_client::{Instructions, RpcChain, TransactionBuilder};
use orebot_miner::{Config, Engine, EngineConfig, JsonStore, Store};
use orebot_types::{
    lamports_to_sol, sol_to_lamports, Addresses, BetEdit, BetResult, LAMPORTS_PER_SOL,
};
use solana_sdk::signature::Signer;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tracing::{error, info};

struct MetricsState {
    context: tokio::Context,
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> Result<Response<Body>, StatusCode> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(state.context.encode()))
        .map_err(|err| {
            error!("metrics response build failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

fn spawn_metrics_server(context: tokio::Context, addr: SocketAddr) {
    let state = Arc::new(MetricsState {
        context: context.clone(),
    });
    context.with_label("metrics").spawn(move |_context| async move {
        let listener = match ::tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("metrics server bind failed on {addr}: {err}");
                return;
            }
        };
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(state);
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            error!("metrics server failed on {addr}: {err}");
        }
    });
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    let config_file = matches
        .get_one::<String>("config")
        .context("missing --config")?;
    let contents = std::fs::read_to_string(config_file)
        .with_context(|| format!("Could not read config file {config_file}"))?;
    serde_yaml::from_str(&contents).context("Could not parse config file")
}

fn parse_squares(value: &str) -> Result<Vec<usize>> {
    value
        .split(',')
        .filter(|square| !square.trim().is_empty())
        .map(|square| {
            square
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid square {square}"))
        })
        .collect()
}

fn print_history(store: &JsonStore) -> Result<()> {
    let stats = store.load_stats()?;
    let ledger = store.load_ledger()?;
    println!(
        "rounds played: {}  won: {}  skipped: {}  claimed: {:.6} SOL",
        stats.rounds_played,
        stats.rounds_won,
        stats.rounds_skipped,
        lamports_to_sol(stats.sol_claimed)
    );
    if let (Some(actual), Some(expected)) = (ledger.actual_win_rate(), ledger.expected_win_rate()) {
        println!("win rate: {actual:.2}% (expected {expected:.2}%)");
    }
    for record in ledger.iter() {
        let final_ev = record
            .final_ev
            .map(|ev| format!("{:+.6} SOL", ev / LAMPORTS_PER_SOL as f64))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "round {:>8}  {:<10} squares {:?}  bet {:.6} SOL  ev {:+.2}%  final ev {}",
            record.round_id,
            record.result.to_string(),
            record.bet_squares,
            lamports_to_sol(record.bet_amount),
            record.ev_percent(),
            final_ev,
        );
    }
    Ok(())
}

fn edit_record(store: &JsonStore, matches: &ArgMatches) -> Result<()> {
    let round_id = *matches.get_one::<u64>("round").context("missing --round")?;
    let result = matches
        .get_one::<String>("result")
        .map(|value| value.parse::<BetResult>())
        .transpose()?;
    let final_ev = match matches.get_one::<String>("final-ev").map(String::as_str) {
        None => None,
        Some("none") => Some(None),
        Some(value) => Some(Some(
            value
                .parse::<f64>()
                .with_context(|| format!("Invalid final EV {value}"))?,
        )),
    };
    let edit = BetEdit {
        round_id: matches.get_one::<u64>("new-round").copied(),
        bet_amount: matches
            .get_one::<f64>("bet-amount")
            .map(|amount| sol_to_lamports(*amount)),
        result,
        won: matches.get_one::<bool>("won").copied(),
        final_ev,
        bet_squares: matches
            .get_one::<String>("squares")
            .map(String::as_str)
            .map(parse_squares)
            .transpose()?,
        ..BetEdit::default()
    };

    let mut ledger = store.load_ledger()?;
    ledger
        .apply_edit(round_id, edit)
        .with_context(|| format!("Could not edit round {round_id}"))?;
    store.save_ledger(&ledger)?;
    println!("updated round {round_id}");
    Ok(())
}

fn clear_history(store: &JsonStore) -> Result<()> {
    let mut ledger = store.load_ledger()?;
    let cleared = ledger.len();
    ledger.clear();
    store.save_ledger(&ledger)?;
    println!("cleared {cleared} records");
    Ok(())
}

fn run(config: Config) -> Result<()> {
    let redacted = format!("{:?}", config.redacted_debug());
    let config = config.validate().context("Invalid config")?;

    let cfg = tokio::Config::default()
        .with_tcp_nodelay(Some(true))
        .with_worker_threads(config.worker_threads)
        .with_catch_panics(true);
    let executor = tokio::Runner::new(cfg);

    executor.start(|context| async move {
        let context = context.with_label("orebot");
        let result: Result<()> = async {
            tokio::telemetry::init(
                context.with_label("telemetry"),
                tokio::telemetry::Logging {
                    level: config.log_level,
                    json: config.json_logs,
                },
                None,
                None,
            );
            info!(config = %redacted, "loaded config file");

            if let Some(port) = config.metrics_port {
                let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                spawn_metrics_server(context.clone(), addr);
            }

            let authority = config.signer.pubkey();
            let addresses = Addresses::new(config.program_id, authority)
                .context("Could not derive program addresses")?;
            info!(%authority, miner = %addresses.miner, "derived addresses");

            let chain = RpcChain::new(&config.rpc_url);
            let builder = TransactionBuilder::new(
                config.signer.clone(),
                Instructions::new(addresses, config.discriminators),
                config.compute_unit_limit,
            );
            let store = JsonStore::open(&config.data_directory)
                .context("Could not open data directory")?;
            let engine = Engine::new(
                context.with_label("engine"),
                EngineConfig {
                    policy: config.policy,
                    ore_price: config.ore_price,
                    price_feed: config.price_feed,
                },
                chain,
                builder,
                store,
            )
            .context("Could not start engine")?;
            engine.run().await;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(?e, "bot failed");
        }
    });

    Ok(())
}

fn main() {
    if let Err(err) = main_result() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn main_result() -> Result<()> {
    let matches = Command::new("orebot")
        .about("Bets on ORE rounds when the expected value is positive.")
        .arg(Arg::new("config").long("config").required(true).global(true))
        .subcommand(Command::new("run").about("Run the bot (default)"))
        .subcommand(Command::new("history").about("Print stats and bet history"))
        .subcommand(
            Command::new("edit")
                .about("Correct a history record")
                .arg(
                    Arg::new("round")
                        .long("round")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("new-round")
                        .long("new-round")
                        .value_parser(value_parser!(u64)),
                )
                .arg(Arg::new("result").long("result").help("pending, win, loss, skipped or missed:<slots>"))
                .arg(
                    Arg::new("won")
                        .long("won")
                        .value_parser(value_parser!(bool))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("final-ev")
                        .long("final-ev")
                        .help("Final EV in lamports, or 'none' to clear"),
                )
                .arg(
                    Arg::new("bet-amount")
                        .long("bet-amount")
                        .help("Stake per square in SOL")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("squares")
                        .long("squares")
                        .help("Comma separated square indices"),
                ),
        )
        .subcommand(Command::new("clear").about("Delete all history records"))
        .get_matches();

    let config = load_config(&matches)?;
    match matches.subcommand() {
        None | Some(("run", _)) => run(config),
        Some((command, sub_matches)) => {
            let store = JsonStore::open(&config.data_directory)
                .context("Could not open data directory")?;
            match command {
                "history" => print_history(&store),
                "edit" => edit_record(&store, sub_matches),
                "clear" => clear_history(&store),
                _ => anyhow::bail!("unknown command {command}"),
            }
        }
    }
}
