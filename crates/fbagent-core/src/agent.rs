//! Agent assembly: configuration in, running engine out.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::commands::CorePlugin;
use crate::config::{AgentConfig, StorageLayout};
use crate::download::{DownloadBuffer, free_memory, scratch_size};
use crate::engine::{Engine, Services, builtins};
use crate::events::{AgentObserver, TracingObserver};
use crate::mbr::MbrPlugin;
use crate::osip::OsipPlugin;
use crate::power::{PowerControl, SystemPower};
use crate::registry::{Plugin, Registry};
use crate::script::{ScriptError, load_script, run_script};
use crate::storage::{LinuxStorage, StorageProvider, VolumeTable};
use crate::transport::TransportHub;

pub struct Agent {
    engine: Arc<Engine>,
}

impl Agent {
    /// Build an agent driving the real system.
    pub fn new(config: AgentConfig) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::new(LinuxStorage),
            Arc::new(SystemPower),
            Arc::new(TracingObserver),
            &[],
        )
    }

    /// Build an agent with explicit collaborators and extra plugins.
    ///
    /// Extra plugins register after the core set, so they may replace core
    /// commands.
    pub fn with_parts(
        config: AgentConfig,
        storage: Arc<dyn StorageProvider>,
        power: Arc<dyn PowerControl>,
        observer: Arc<dyn AgentObserver>,
        plugins: &[&dyn Plugin],
    ) -> Result<Self> {
        let capacity = scratch_size(config.scratch_size, free_memory())
            .context("cannot size the scratch buffer")?;
        let download = DownloadBuffer::new(capacity, &config.overflow_path)?;

        let mut builder = Registry::builder();
        builtins::register(&mut builder, capacity)?;
        builder.with_plugin(&CorePlugin::new(config.product.clone()))?;
        match config.layout {
            StorageLayout::Osip => builder.with_plugin(&OsipPlugin::new(&config.osip_device))?,
            StorageLayout::Mbr => builder.with_plugin(&MbrPlugin::new(&config.disk_device))?,
        }
        for plugin in plugins {
            builder.with_plugin(*plugin)?;
        }
        let registry = builder.build();
        info!(
            capacity,
            layout = ?config.layout,
            commands = registry.commands().count(),
            "Agent ready"
        );

        let services = Services {
            volumes: VolumeTable::new(config.volumes.clone()),
            config,
            storage,
            power,
            observer,
        };
        Ok(Self {
            engine: Arc::new(Engine::new(
                Arc::new(registry),
                Arc::new(Mutex::new(download)),
                Arc::new(services),
            )),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run the script at `path` on a worker thread.
    pub fn spawn_script(&self, path: PathBuf) -> JoinHandle<Result<usize, ScriptError>> {
        let engine = Arc::clone(&self.engine);
        thread::spawn(move || {
            let steps = load_script(&path)?;
            info!(path = %path.display(), steps = steps.len(), "Running install script");
            let result = run_script(&engine, &steps);
            if let Err(e) = &result {
                error!(error = %e, "Install script failed");
            }
            result
        })
    }

    /// Start the configured script, then serve hosts forever.
    pub fn run(self) -> ! {
        let config = &self.engine.services().config;
        if let Some(path) = config.script_path.clone() {
            // the worker reports its own outcome
            drop(self.spawn_script(path));
        }
        let mut hub = TransportHub::new(config.hub_config());
        self.engine.serve(&mut hub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::power::{RebootTarget, RecordingPower};
    use crate::protocol::Response;
    use crate::storage::MemStorage;
    use crate::transport::MockTransport;

    fn config() -> AgentConfig {
        static NEXT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let id = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        AgentConfig {
            product: "testboard".into(),
            scratch_size: 4096,
            overflow_path: std::env::temp_dir().join(format!("fbagent-agent-{}-{id}", std::process::id())),
            ..AgentConfig::default()
        }
    }

    fn agent(config: AgentConfig, power: Arc<RecordingPower>) -> Agent {
        Agent::with_parts(
            config,
            Arc::new(MemStorage::new()),
            power,
            Arc::new(NullObserver),
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_agent_wires_registry() {
        let agent = agent(config(), Arc::new(RecordingPower::default()));
        let registry = agent.engine().registry();
        assert!(registry.find_command("flash:boot").is_some());
        assert!(registry.flash_handler("boot").is_some());
        assert!(registry.oem_handler("write_osip_header").is_some());
        assert!(registry.oem_handler("repart").is_none());

        let mock = MockTransport::new();
        mock.queue_command("getvar:product");
        mock.queue_command("getvar:max-download-size");
        agent.engine().run_connection(Box::new(mock.clone()));
        assert_eq!(
            mock.responses(),
            vec![Response::okay("testboard"), Response::okay("4096")]
        );
    }

    #[test]
    fn test_mbr_layout_selected() {
        let mut config = config();
        config.layout = StorageLayout::Mbr;
        let agent = agent(config, Arc::new(RecordingPower::default()));
        let registry = agent.engine().registry();
        assert!(registry.oem_handler("repart").is_some());
        assert!(registry.flash_handler("boot").is_none());
    }

    #[test]
    fn test_spawned_script() {
        let script = std::env::temp_dir().join(format!("fbagent-agent-{}.cmd", std::process::id()));
        std::fs::write(&script, "oem showtext\nreboot-bootloader\n").unwrap();
        let power = Arc::new(RecordingPower::default());
        let agent = agent(config(), power.clone());

        let done = agent.spawn_script(script.clone()).join().unwrap().unwrap();
        assert_eq!(done, 2);
        assert_eq!(power.requests(), vec![RebootTarget::Bootloader]);
        std::fs::remove_file(&script).unwrap();
    }

    #[test]
    fn test_extra_plugin_cannot_duplicate() {
        struct Dup;
        impl Plugin for Dup {
            fn name(&self) -> &str {
                "dup"
            }
            fn register(
                &self,
                builder: &mut crate::registry::RegistryBuilder,
            ) -> Result<(), crate::registry::RegistryError> {
                builder.register_command("boot", |ctx, _| {
                    ctx.okay("")?;
                    Ok(())
                })
            }
        }
        let result = Agent::with_parts(
            config(),
            Arc::new(MemStorage::new()),
            Arc::new(RecordingPower::default()),
            Arc::new(NullObserver),
            &[&Dup],
        );
        assert!(result.is_err());
    }
}
