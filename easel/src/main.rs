use std::{path::Path, sync::Arc};

use easel_core::{
    ChannelConfig, Engine, EngineConfig,
    events::bits,
    refresh::SpaceProbe,
};

mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = config::Config::load();
    let data_dir = Path::new(&config.general.data_dir);
    std::fs::create_dir_all(data_dir)?;

    let mut engine = Engine::new(EngineConfig {
        channels_dir: data_dir.join("channels"),
        vault_dir: data_dir.join("vault"),
        catalog_base_url: config.general.catalog_base_url.clone(),
        device_id: config.general.device_id.clone(),
        device_token: config.general.device_token.clone(),
        settings: config.playback.clone(),
        space_probe: Some(sysinfo_space_probe()),
    });

    // On a host the transports are ambient: the bridge that reports Wi-Fi,
    // MQTT, and storage state on embedded targets is out of scope here.
    engine
        .bus()
        .set(bits::WIFI_CONNECTED | bits::MQTT_CONNECTED | bits::SD_AVAILABLE);

    let specs = if config.channels.is_empty() {
        vec![config::ChannelSpec::default()]
    } else {
        config.channels
    };

    let mut channels = Vec::new();
    for spec in specs {
        let channel = engine
            .open_channel(ChannelConfig {
                channel_id: spec.id.clone(),
                selector: spec.parsed_selector(),
                sort: spec.parsed_sort(),
                overrides: spec.overrides.clone(),
            })
            .await?;
        tracing::info!("opened channel {}", channel.channel_id());
        channels.push(channel);
    }

    if let Some(active) = channels.first() {
        engine.activate(active);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    let bus = engine.bus().clone();
    for channel in channels {
        channel.close(&bus).await;
    }
    engine.shutdown().await;

    Ok(())
}

/// Free-space probe over the host's mounted disks: the disk whose mount
/// point is the longest prefix of the vault path wins.
fn sysinfo_space_probe() -> SpaceProbe {
    Arc::new(|path: &Path| {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    })
}
