//! Bluetooth LE peripheral host for tokio.
//!
//! `bluefin` owns a Bluetooth controller exclusively through a Linux HCI User
//! Channel and implements the host side of the protocol stack a peripheral
//! needs: the HCI command/event dialogue, ACL fragmentation and controller
//! buffer accounting, and L2CAP multiplexing with LE Credit Based Flow
//! Control channels.
//!
//! The entry point is [`Adapter`]. A typical peripheral brings the controller
//! up, starts advertising, and accepts connections and channels:
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use bluefin::proto::advertise::{AdStructure, AD_FLAG_LE_GENERAL_DISCOVERABLE};
//! use bluefin::proto::frame::LeCreditConnectionResult;
//! use bluefin::{Adapter, L2cap};
//!
//! let adapter = Adapter::open(0)?;
//! adapter.reset().await?;
//! adapter
//!     .set_advertising_data(&[AdStructure::Flags(AD_FLAG_LE_GENERAL_DISCOVERABLE)])
//!     .await?;
//! adapter.le_set_advertising_enable(true).await?;
//!
//! let conn = adapter.accept().await?;
//! let l2cap = L2cap::new(conn);
//! let pending = l2cap.accept().await?;
//! if pending.psm() == 0x0080 {
//!     let channel = pending.approve(256).await?;
//!     let mut buf = vec![0; 256];
//!     while let Some(n) = channel.read(&mut buf).await? {
//!         channel.write(&buf[..n]).await?;
//!     }
//! } else {
//!     pending.reject(LeCreditConnectionResult::SpsmNotSupported).await?;
//! }
//! # Ok(()) }
//! ```
//!
//! Wire types live in [`proto`] (`bluefin-proto`), which is usable on its own
//! for tooling that only needs the codecs.

#![warn(missing_docs)]

pub use proto;

mod adapter;
mod channel;
mod config;
mod connection;
mod l2cap;
#[cfg(target_os = "linux")]
mod socket;
mod transport;

#[cfg(test)]
mod tests;

pub use adapter::{Adapter, AdapterError, CommandError};
pub use channel::{Channel, PendingChannel, ReadError, WriteError};
pub use config::ChannelConfig;
pub use connection::{Connection, ConnectionError};
pub use l2cap::L2cap;
#[cfg(target_os = "linux")]
pub use socket::HciSocket;
pub use transport::Transport;
