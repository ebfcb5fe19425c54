//! An LE peripheral that advertises as "bluefin" and echoes every SDU
//! received on PSM 0x0080.
//!
//! Needs exclusive access to a controller: `sudo setcap cap_net_admin+ep`
//! the binary, or run it as root, after stopping bluetoothd.

use anyhow::{Context, Result};
use tracing::{error, info};

use bluefin::proto::advertise::{
    AdStructure, AdvertisingParameters, AD_FLAG_BR_EDR_NOT_SUPPORTED,
    AD_FLAG_LE_GENERAL_DISCOVERABLE,
};
use bluefin::proto::cmd::{EventMask, LeEventMask};
use bluefin::proto::frame::LeCreditConnectionResult;
use bluefin::{Adapter, Channel, L2cap};

const ECHO_PSM: u16 = 0x0080;

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("HCI user channels only exist on Linux");
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bluefin=debug".into()),
        )
        .init();

    let dev = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()
        .context("device index must be a number")?
        .unwrap_or(0);

    let adapter = Adapter::open(dev).context("opening the HCI user channel")?;
    adapter.reset().await?;

    let addr = adapter.read_bd_addr().await?;
    info!(%addr, "controller up");

    adapter.clear_filter_accept_list().await?;
    info!(
        filter_accept_list = adapter.read_filter_accept_list_size().await?,
        "filter accept list cleared"
    );

    adapter
        .set_event_mask(
            EventMask::DISCONNECTION_COMPLETE
                | EventMask::ENCRYPTION_CHANGE
                | EventMask::HARDWARE_ERROR
                | EventMask::ENCRYPTION_KEY_REFRESH_COMPLETE
                | EventMask::LE_META,
        )
        .await?;
    adapter
        .le_set_event_mask(
            LeEventMask::CONNECTION_COMPLETE
                | LeEventMask::ADVERTISING_REPORT
                | LeEventMask::CONNECTION_UPDATE_COMPLETE
                | LeEventMask::READ_REMOTE_FEATURES_COMPLETE
                | LeEventMask::LONG_TERM_KEY_REQUEST,
        )
        .await?;

    let buffers = adapter.le_read_buffer_size().await?;
    info!(?buffers, "buffer geometry");
    let states = adapter.le_read_supported_states().await?;
    info!(states = %format_args!("{states:#018x}"), "supported states");

    adapter
        .set_advertising_data(&[
            AdStructure::Flags(AD_FLAG_LE_GENERAL_DISCOVERABLE | AD_FLAG_BR_EDR_NOT_SUPPORTED),
            AdStructure::CompleteLocalName(b"bluefin"),
        ])
        .await?;
    adapter
        .le_set_advertising_parameters(AdvertisingParameters {
            interval_min: 0x0064,
            interval_max: 0x0078,
            ..Default::default()
        })
        .await?;
    adapter.le_set_advertising_enable(true).await?;
    info!("advertising");

    loop {
        let conn = adapter.accept().await?;
        info!(peer = %conn.peer_addr(), handle = %conn.handle(), "connected");
        tokio::spawn(async move {
            let l2cap = L2cap::new(conn);
            loop {
                let pending = match l2cap.accept().await {
                    Ok(pending) => pending,
                    Err(e) => {
                        info!(error = %e, "link closed");
                        return;
                    }
                };
                if pending.psm() != ECHO_PSM {
                    info!(psm = pending.psm(), "rejecting channel");
                    let _ = pending
                        .reject(LeCreditConnectionResult::SpsmNotSupported)
                        .await;
                    continue;
                }
                match pending.approve(u16::MAX).await {
                    Ok(channel) => {
                        tokio::spawn(async move {
                            if let Err(e) = echo(&channel).await {
                                error!(error = %e, "echo failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "approval failed"),
                }
            }
        });
    }
}

async fn echo(channel: &Channel) -> Result<()> {
    let mut buf = vec![0; usize::from(channel.mtu())];
    while let Some(n) = channel.read(&mut buf).await? {
        info!(bytes = n, "echoing");
        channel.write(&buf[..n]).await?;
    }
    info!("channel closed");
    Ok(())
}
