use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use ahash::AHashSet;
use anyhow::Context;
use postern_common::{
    Signal,
    address::MailAddress,
    internal,
    logging::{self, LoggingConfig},
};
use postern_control::{ControlServer, DEFAULT_CONTROL_SOCKET};
use postern_delivery::{DeliveryConfig, DeliveryService, RemoteDelivery};
use postern_processor::{
    MailetContext, ProcessorConfig, Registry, RegistryContext, SpoolManager, registry::Params,
};
use postern_smtp::{SmtpConfig, SmtpServer, StaticUsers, auth::User};
use postern_spool::{MailStore, SpoolConfig};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::control_handler::SpoolControlHandler;

/// The whole server, as described by its configuration file.
///
/// ```ron
/// (
///     smtp: (listen: "0.0.0.0:25", hostname: "mx.example.com", local_domains: ["example.com"]),
///     users: [(name: "alice", password: "secret")],
///     spool: File(path: "/var/spool/postern/root"),
///     outgoing: File(path: "/var/spool/postern/outgoing"),
///     inbox: Some(File(path: "/var/spool/postern/inbox")),
///     processors: [
///         (name: "root", stages: [
///             (matcher: "RecipientIsLocal", mailet: "LocalDelivery"),
///             (matcher: "All", mailet: "RemoteDelivery"),
///         ]),
///         (name: "error", stages: [(matcher: "All", mailet: "Bounce")]),
///     ],
///     delivery: (delay_time: ["5 minutes", "2*30 minutes", "6 hours"]),
/// )
/// ```
#[derive(Debug, Deserialize)]
pub struct Postern {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub spool: SpoolConfig,
    #[serde(default)]
    pub outgoing: SpoolConfig,
    /// Where `LocalDelivery` stores mail for local users
    #[serde(default)]
    pub inbox: Option<SpoolConfig>,
    #[serde(default = "defaults::spool_threads")]
    pub spool_threads: usize,
    #[serde(default = "defaults::processors")]
    pub processors: Vec<ProcessorConfig>,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Reply address of bounces, `postmaster@<hostname>` if unset
    #[serde(default)]
    pub postmaster: Option<String>,
    /// Unix socket for `posternctl`, none to run without one
    #[serde(default = "defaults::control_socket")]
    pub control_socket: Option<PathBuf>,
}

mod defaults {
    use std::path::PathBuf;

    use postern_processor::{ProcessorConfig, StageConfig};

    pub const fn spool_threads() -> usize {
        4
    }

    pub fn control_socket() -> Option<PathBuf> {
        Some(PathBuf::from(super::DEFAULT_CONTROL_SOCKET))
    }

    fn stage(matcher: &str, mailet: &str) -> StageConfig {
        StageConfig {
            matcher: matcher.to_string(),
            mailet: mailet.to_string(),
            params: super::Params::default(),
        }
    }

    /// Relay everything, bounce what fails.
    pub fn processors() -> Vec<ProcessorConfig> {
        vec![
            ProcessorConfig {
                name: String::from("root"),
                stages: vec![stage("All", "RemoteDelivery")],
            },
            ProcessorConfig {
                name: String::from("error"),
                stages: vec![stage("All", "Bounce")],
            },
        ]
    }
}

impl Default for Postern {
    fn default() -> Self {
        Self {
            smtp: SmtpConfig::default(),
            users: Vec::default(),
            spool: SpoolConfig::default(),
            outgoing: SpoolConfig::default(),
            inbox: None,
            spool_threads: defaults::spool_threads(),
            processors: defaults::processors(),
            delivery: DeliveryConfig::default(),
            logging: LoggingConfig::default(),
            postmaster: None,
            control_socket: defaults::control_socket(),
        }
    }
}

/// Every long running part of the server, wired together but not started.
#[derive(Debug)]
pub struct Components {
    pub smtp: SmtpServer,
    pub manager: Arc<SpoolManager>,
    pub delivery: Arc<DeliveryService>,
    pub spool: Arc<dyn MailStore>,
    pub outgoing: Arc<dyn MailStore>,
    pub inbox: Option<Arc<dyn MailStore>>,
    pub control: Option<ControlServer>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

impl Postern {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        ron::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    fn postmaster(&self) -> anyhow::Result<MailAddress> {
        self.postmaster.as_deref().map_or_else(
            || Ok(MailAddress::new("postmaster", self.smtp.hostname.clone())),
            |address| {
                address
                    .parse()
                    .with_context(|| format!("Invalid postmaster address {address}"))
            },
        )
    }

    /// Open the stores and build every component from this configuration.
    pub async fn build(self) -> anyhow::Result<Components> {
        let spool = self.spool.clone().open("spool").await?;
        let outgoing = self.outgoing.clone().open("outgoing").await?;
        let inbox = match self.inbox.clone() {
            Some(config) => Some(config.open("inbox").await?),
            None => None,
        };

        let postmaster = self.postmaster()?;
        let local_domains: Arc<[String]> = self.smtp.local_domains.clone().into();
        let local_users = self
            .users
            .iter()
            .map(|user| user.name.to_ascii_lowercase())
            .collect::<AHashSet<_>>();

        let mut registry = Registry::with_builtins(&RegistryContext {
            local_domains: Arc::clone(&local_domains),
            local_users: Arc::new(local_users),
            inbox: inbox.clone(),
        });
        RemoteDelivery::register(&mut registry, Arc::clone(&outgoing));

        let processors = registry
            .build(&self.processors)
            .context("Invalid processor configuration")?;

        let context = MailetContext::new(
            Arc::clone(&spool),
            self.smtp.hostname.clone(),
            postmaster,
            local_domains,
        );

        let resolver = DeliveryService::resolver(&self.delivery)?;
        let delivery = Arc::new(DeliveryService::new(
            Arc::clone(&outgoing),
            context.clone(),
            resolver,
            self.delivery,
        ));
        let manager = Arc::new(SpoolManager::new(processors, context, self.spool_threads));

        let smtp = SmtpServer::new(
            self.smtp,
            Arc::clone(&spool),
            Arc::new(StaticUsers::new(self.users)),
        );

        let control = self.control_socket.map(|path| {
            ControlServer::new(
                path,
                Arc::new(SpoolControlHandler::new(
                    Arc::clone(&spool),
                    Arc::clone(&outgoing),
                    inbox.clone(),
                )),
            )
        });

        Ok(Components {
            smtp,
            manager,
            delivery,
            spool,
            outgoing,
            inbox,
            control,
        })
    }

    /// Run the server until it is told to stop.
    ///
    /// # Errors
    ///
    /// If a store cannot be opened, the processors are misconfigured, or the
    /// SMTP listener cannot bind.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init(&self.logging);

        let Components {
            smtp,
            manager,
            delivery,
            control,
            ..
        } = self.build().await?;

        internal!(level = INFO, "Controller running");

        let manager = tokio::spawn(manager.run(SHUTDOWN_BROADCAST.subscribe()));
        let delivery = tokio::spawn(delivery.run(SHUTDOWN_BROADCAST.subscribe()));
        let control = control.map(|control| {
            let shutdown = SHUTDOWN_BROADCAST.subscribe();
            tokio::spawn(async move {
                if let Err(err) = control.run(shutdown).await {
                    internal!(level = ERROR, "Control socket failed: {err}");
                }
            })
        });
        let shutdown = SHUTDOWN_BROADCAST.subscribe();
        let mut smtp = tokio::spawn(async move { smtp.run(shutdown).await });

        let (result, smtp_stopped) = tokio::select! {
            signal = wait_for_signal() => (signal, false),
            served = &mut smtp => (served.map_err(anyhow::Error::from).and_then(|served| served), true),
        };

        internal!(level = INFO, "Shutting down...");
        // Nobody listening just means everything already stopped
        let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);

        let draining = async {
            if !smtp_stopped && let Ok(Err(err)) = smtp.await {
                internal!(level = ERROR, "SMTP server failed while stopping: {err}");
            }
            let _ = tokio::join!(manager, delivery);
            if let Some(control) = control {
                let _ = control.await;
            }
        };

        tokio::select! {
            () = draining => {
                let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);
                internal!(level = INFO, "All components stopped");
            }
            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forced shutdown");
            }
        }

        result
    }
}
