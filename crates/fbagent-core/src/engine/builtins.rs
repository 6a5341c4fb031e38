//! Commands intrinsic to the engine: `getvar:` and `download:`.

use anyhow::Result;
use tracing::{debug, warn};

use super::{CommandContext, ProtocolState, ResponseError};
use crate::download::DownloadError;
use crate::events::AgentEvent;
use crate::protocol::{BOOTLOADER_VERSION, KERNEL_NAME, ProtocolError, parse_download_length};
use crate::registry::{RegistryBuilder, RegistryError};

/// Register the intrinsic commands and the variables they rely on.
pub fn register(builder: &mut RegistryBuilder, max_download: usize) -> Result<(), RegistryError> {
    builder.publish("version-bootloader", BOOTLOADER_VERSION);
    builder.publish("kernel", KERNEL_NAME);
    builder.publish("max-download-size", max_download.to_string());
    builder.register_command("getvar:", cmd_getvar)?;
    builder.register_command("download:", cmd_download)?;
    Ok(())
}

fn cmd_getvar(ctx: &mut CommandContext<'_>, arg: &str) -> Result<()> {
    if arg == "all" {
        return getvar_all(ctx);
    }
    let value = ctx.registry.resolve(ctx.services, arg).unwrap_or_default();
    debug!(name = %arg, value = %value, "getvar");
    ctx.okay(&value)?;
    Ok(())
}

fn getvar_all(ctx: &mut CommandContext<'_>) -> Result<()> {
    let registry = ctx.registry;
    let services = ctx.services;

    for volume in services.volumes.iter() {
        for name in ["partition-type", "partition-size"] {
            let query = format!("{name}:{}", volume.name);
            let Some(value) = registry.resolve(services, &query) else {
                continue;
            };
            match ctx.info(&format!("{query}: {value}")) {
                Ok(()) => {}
                Err(ResponseError::Protocol(ProtocolError::ResponseTooLong { .. })) => {
                    ctx.fail("Unable to get partition info, partition name too long")?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    for (name, value) in registry.static_variables() {
        ctx.info(&format!("{name}: {value}"))?;
    }
    ctx.okay("")?;
    Ok(())
}

fn cmd_download(ctx: &mut CommandContext<'_>, arg: &str) -> Result<()> {
    let len = parse_download_length(arg)? as usize;

    let target = match ctx.download.begin(len) {
        Ok(target) => target,
        Err(e) => {
            warn!(len, error = %e, "Cannot stage download");
            ctx.fail(&e.to_string())?;
            return Ok(());
        }
    };
    ctx.session.send_data(len as u32)?;

    let observer = ctx.services.observer.clone();
    let result = ctx.download.receive(
        target,
        ctx.session.transport_mut(),
        len,
        &mut |current, total| {
            observer.on_event(&AgentEvent::Progress {
                operation: "download".to_string(),
                current,
                total,
            })
        },
    );

    match result {
        Ok(_) => {
            ctx.okay("")?;
            Ok(())
        }
        Err(DownloadError::Transport(e)) => {
            ctx.session.goto(ProtocolState::Error);
            Err(e.into())
        }
        Err(e) => {
            ctx.fail(&e.to_string())?;
            Ok(())
        }
    }
}
