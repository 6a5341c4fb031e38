//! Core command set: flash, erase, boot, reboot, oem.

use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::download::Payload;
use crate::engine::{CommandContext, Services};
use crate::events::LogLevel;
use crate::flash::{self, FlashContext, FlashError, FlashOutcome};
use crate::power::RebootTarget;
use crate::protocol::split_oem_args;
use crate::registry::{Plugin, RegistryBuilder, RegistryError};
use crate::storage::StorageError;

/// OTA package name inside the cache directory.
const OTA_UPDATE_FILE: &str = "update.zip";

/// Registers the commands every agent carries.
pub struct CorePlugin {
    product: String,
}

impl CorePlugin {
    pub fn new(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
        }
    }
}

impl Plugin for CorePlugin {
    fn name(&self) -> &str {
        "core"
    }

    fn register(&self, builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
        builder.publish("product", self.product.clone());
        builder.publish_resolver("partition-size", var_partition_size);
        builder.publish_resolver("partition-type", |services, name| {
            services
                .volumes
                .lookup(name)
                .ok()
                .map(|v| v.fs_type.clone())
        });

        builder.register_command("flash:", cmd_flash)?;
        builder.register_command("erase:", cmd_erase)?;
        builder.register_command("boot", cmd_boot)?;
        builder.register_command("reboot", |ctx, _| reboot(ctx, RebootTarget::System))?;
        builder.register_command("reboot-bootloader", |ctx, _| {
            reboot(ctx, RebootTarget::Bootloader)
        })?;
        builder.register_command("continue", |ctx, _| reboot(ctx, RebootTarget::System))?;
        builder.register_command("oem", cmd_oem)?;

        builder.register_oem("reboot", oem_reboot)?;
        builder.register_flash("update", flash_update)?;
        Ok(())
    }
}

fn var_partition_size(services: &Services, name: &str) -> Option<String> {
    let volume = services.volumes.lookup(name).ok()?;
    let size = services
        .storage
        .open(&volume.device)
        .and_then(|mut dev| dev.size_bytes());
    match size {
        Ok(size) => Some(format!("0x{size:016x}")),
        Err(e) => {
            warn!(partition = %name, error = %e, "Cannot size partition");
            None
        }
    }
}

fn cmd_flash(ctx: &mut CommandContext<'_>, name: &str) -> Result<()> {
    ctx.services
        .message(LogLevel::Info, format!("FLASH {name}..."));
    let Some(payload) = ctx.download.payload() else {
        return Err(FlashError::NoPayload.into());
    };
    let spilled = payload.is_spilled();
    let result = flash::flash(ctx.registry, ctx.services, name, payload);
    if spilled {
        ctx.download.clear();
    }

    match result {
        Ok(outcome) => {
            ctx.services.message(LogLevel::Info, "FLASH COMPLETE!");
            ctx.session.okay("")?;
            if let FlashOutcome::Reboot(target) = outcome {
                ctx.services.power.reboot(&target)?;
            }
            Ok(())
        }
        Err(e) => {
            warn!(partition = %name, error = %e, "Flash failed");
            ctx.services.message(LogLevel::Error, "FLASH FAILED!");
            Err(e.into())
        }
    }
}

fn cmd_erase(ctx: &mut CommandContext<'_>, name: &str) -> Result<()> {
    ctx.services
        .message(LogLevel::Info, format!("ERASE {name}..."));
    let volume = ctx.services.volumes.lookup(name)?;
    let result = ctx
        .services
        .storage
        .open(&volume.device)
        .and_then(|mut dev| -> Result<(), StorageError> {
            let size = dev.size_bytes()?;
            dev.discard(0, size)?;
            dev.sync()
        });
    match result {
        Ok(()) => {
            info!(partition = %name, "Partition erased");
            ctx.okay("")?;
        }
        Err(e) => {
            warn!(partition = %name, error = %e, "Erase failed");
            ctx.fail("unable to format")?;
        }
    }
    Ok(())
}

fn cmd_boot(ctx: &mut CommandContext<'_>, _arg: &str) -> Result<()> {
    ctx.fail("boot command stubbed on this platform!")?;
    Ok(())
}

fn reboot(ctx: &mut CommandContext<'_>, target: RebootTarget) -> Result<()> {
    ctx.okay("")?;
    ctx.services
        .message(LogLevel::Info, format!("REBOOT in {target}..."));
    ctx.services.power.reboot(&target)?;
    Ok(())
}

fn cmd_oem(ctx: &mut CommandContext<'_>, arg: &str) -> Result<()> {
    let args = split_oem_args(arg);
    let Some(&name) = args.first() else {
        ctx.fail("empty OEM command")?;
        return Ok(());
    };

    let registry = ctx.registry;
    if let Some(handler) = registry.oem_handler(name) {
        ctx.services
            .message(LogLevel::Info, format!("CMD '{name}'..."));
        match handler(ctx, &args) {
            Ok(()) => {
                ctx.services
                    .message(LogLevel::Info, format!("CMD '{name}' COMPLETE."));
                ctx.okay("")?;
            }
            Err(e) => {
                warn!(command = %name, error = %e, "OEM command failed");
                ctx.fail(name)?;
            }
        }
        return Ok(());
    }

    match name {
        "system" => ctx.fail("OEM system command are not supported anymore")?,
        "showtext" => ctx.okay("")?,
        _ => ctx.fail("unknown OEM command")?,
    }
    Ok(())
}

fn oem_reboot(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<()> {
    let target = match args {
        [_] => RebootTarget::System,
        [_, target] => RebootTarget::from_arg(target),
        _ => {
            ctx.fail("Usage: reboot [target_os]")?;
            anyhow::bail!("reboot takes zero or one argument");
        }
    };
    reboot(ctx, target)
}

/// Stage an OTA package and arrange for recovery to apply it.
fn flash_update(ctx: &FlashContext<'_>, payload: Payload<'_>) -> Result<FlashOutcome, FlashError> {
    let cache = &ctx.services.config.cache_dir;
    stage_update(cache, payload).map_err(|e| {
        warn!(error = %e, "OTA staging failed");
        ctx.services
            .message(LogLevel::Error, "OTA_UPDATE FAILED!");
        FlashError::Rejected("problem with creating ota update file!".to_string())
    })?;
    ctx.services
        .message(LogLevel::Info, "Rebooting to recovery to apply update.");
    Ok(FlashOutcome::Reboot(RebootTarget::Recovery))
}

fn stage_update(cache: &Path, payload: Payload<'_>) -> Result<(), FlashError> {
    let package = cache.join(OTA_UPDATE_FILE);
    flash::write_file(&package, payload)?;

    let recovery = cache.join("recovery");
    fs::create_dir_all(&recovery)?;
    fs::write(
        recovery.join("command"),
        format!("--update_package={}", package.display()),
    )?;
    nix::unistd::sync();
    Ok(())
}
