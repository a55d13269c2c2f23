use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use multiplayer_sessions::{
    first_matching, FindSessionsComplete, JoinSessionResult, SessionConfig, SessionCoordinator,
    SessionMenu, Travel, UserId,
};
use session_loopback::{CallbackPump, DeliveryMode, LoopbackNetwork, LoopbackSessionBackend};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

#[derive(Parser)]
#[command(name = "lobby_demo")]
#[command(about = "Forge of Stories Lobby - host and join over the in-memory LAN backend")]
struct Args {
    /// Session configuration file (TOML with a [sessions] section)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of players joining the host
    #[arg(short, long, default_value_t = 1)]
    players: u32,

    /// Match type to host and search for
    #[arg(short, long)]
    match_type: Option<String>,

    /// Host a second time, replacing the first session
    #[arg(long)]
    replace: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TravelTarget {
    Server(String),
    Client(String),
}

#[derive(Debug, Default)]
struct TravelLog {
    entries: Mutex<Vec<(UserId, TravelTarget)>>,
}

impl TravelLog {
    fn record(&self, player: &UserId, target: TravelTarget) {
        self.lock().push((player.clone(), target));
    }

    fn entries(&self) -> Vec<(UserId, TravelTarget)> {
        self.lock().clone()
    }

    fn server_travels(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, target)| matches!(target, TravelTarget::Server(_)))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(UserId, TravelTarget)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PlayerTravel {
    player: UserId,
    log: Arc<TravelLog>,
}

impl Travel for PlayerTravel {
    fn server_travel(&self, url: &str) {
        info!(player = %self.player, %url, "server travel");
        self.log.record(&self.player, TravelTarget::Server(url.to_owned()));
    }

    fn client_travel(&self, address: &str) {
        info!(player = %self.player, %address, "client travel");
        self.log
            .record(&self.player, TravelTarget::Client(address.to_owned()));
    }
}

struct Player {
    user: UserId,
    backend: Arc<LoopbackSessionBackend>,
    menu: SessionMenu,
    /// Final result of this player's join attempt.
    outcome: Arc<Mutex<Option<String>>>,
}

impl Player {
    fn spawn(
        network: &LoopbackNetwork,
        name: String,
        address: String,
        config: &SessionConfig,
        log: &Arc<TravelLog>,
    ) -> Self {
        let user = UserId::new(name);
        let backend = Arc::new(LoopbackSessionBackend::new(
            network.clone(),
            user.clone(),
            address,
            DeliveryMode::Queued,
        ));
        let coordinator =
            SessionCoordinator::with_backend(user.clone(), config.clone(), backend.clone());
        let travel = Arc::new(PlayerTravel {
            player: user.clone(),
            log: Arc::clone(log),
        });
        let menu = SessionMenu::setup(&coordinator, config.menu.clone(), travel);

        let outcome = Arc::new(Mutex::new(None));
        let events = coordinator.events();
        let sink = Arc::clone(&outcome);
        let match_type = config.menu.match_type.clone();
        events
            .on_find_complete
            .add(move |found: &FindSessionsComplete| {
                if !found.successful || first_matching(&found.results, &match_type).is_none() {
                    *sink.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some("no matching session".to_owned());
                }
            });
        let sink = Arc::clone(&outcome);
        events.on_join_complete.add(move |result: &JoinSessionResult| {
            *sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.to_string());
        });

        Self {
            user,
            backend,
            menu,
            outcome,
        }
    }

    fn outcome(&self) -> Option<String> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| eyre!("timed out waiting for {what}"))
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(match_type) = args.match_type {
        config.menu.match_type = match_type;
    }

    println!("🎮 Starting Forge of Stories Lobby (Loopback)");
    println!("🏷️  Match type: {}", config.menu.match_type);
    println!("👥 Players: {}", args.players);

    let network = LoopbackNetwork::new();
    let log = Arc::new(TravelLog::default());

    let host = Player::spawn(&network, "host".into(), "127.0.0.1:7777".into(), &config, &log);
    let joiners: Vec<Player> = (1..=args.players)
        .map(|index| {
            Player::spawn(
                &network,
                format!("player-{index}"),
                format!("127.0.0.1:{}", 7777 + index),
                &config,
                &log,
            )
        })
        .collect();

    let backends = std::iter::once(&host)
        .chain(&joiners)
        .map(|player| Arc::clone(&player.backend))
        .collect();
    let pump = CallbackPump::spawn(backends, CallbackPump::DEFAULT_INTERVAL);

    host.menu.host();
    wait_for("session creation", || log.server_travels() >= 1).await?;

    if args.replace {
        println!("🔁 Replacing the hosted session...");
        host.menu.host();
        wait_for("session replacement", || log.server_travels() >= 2).await?;
    }

    for joiner in &joiners {
        joiner.menu.join();
        wait_for("join", || joiner.outcome().is_some()).await?;
    }

    pump.shutdown().await;

    println!("📡 Sessions advertised: {}", network.advertised_count());
    for (player, target) in log.entries() {
        match target {
            TravelTarget::Server(url) => println!("🖥️  {player} → {url}"),
            TravelTarget::Client(address) => println!("🔗 {player} → {address}"),
        }
    }
    for joiner in &joiners {
        let outcome = joiner.outcome().unwrap_or_default();
        println!("   {}: {outcome}", joiner.user);
    }

    Ok(())
}
