//! Packet loop and lifecycle of a running translator.

use crate::NetError;
use crate::packet_io::PacketIO;
use crate::source::{KernelSourceSelector, SourceAddressSelector};
use crate::translator::Translator;
use map646_core::{AddressFamily, Router, read_directives};
use std::future::poll_fn;
use std::path::{Path, PathBuf};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Size of the receive buffer; large enough for any IP packet.
const RECV_BUFFER_LEN: usize = u16::MAX as usize;

/// Requests delivered to the packet loop between packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Re-read the configuration and reinstall routes.
    Reload,
    /// Remove installed routes and stop.
    Shutdown,
}

/// Owns the packet transport, the router and the translation context.
///
/// All state is touched from the packet loop only, so a reload never
/// races with translation.
pub struct Gateway<P, R, S = KernelSourceSelector> {
    io: P,
    router: R,
    translator: Translator<S>,
    config_path: PathBuf,
}

impl<P, R, S> Gateway<P, R, S>
where
    P: PacketIO,
    R: Router,
    S: SourceAddressSelector,
{
    pub fn new(io: P, router: R, translator: Translator<S>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            io,
            router,
            translator,
            config_path: config_path.into(),
        }
    }

    pub fn translator(&self) -> &Translator<S> {
        &self.translator
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the configuration and install routes.
    pub fn start(&mut self) -> Result<(), NetError> {
        self.load_config()?;
        self.translator.mapping().install_routes(&mut self.router)?;
        Ok(())
    }

    /// Drop installed routes, reload the configuration and install routes
    /// for the new table.
    pub fn reload(&mut self) -> Result<(), NetError> {
        info!("reloading {}", self.config_path.display());
        self.translator.mapping().uninstall_routes(&mut self.router);
        self.start()
    }

    /// Remove every route installed for the current table.
    pub fn shutdown(&mut self) {
        self.translator.mapping().uninstall_routes(&mut self.router);
    }

    fn load_config(&mut self) -> Result<(), NetError> {
        let directives = read_directives(&self.config_path)?;
        let mapping = self.translator.mapping_mut();
        mapping.clear();
        mapping.load(&directives)?;
        info!(
            "loaded {} static mappings and {} 6-to-6 mappings, prefix {}",
            mapping.entries().len(),
            mapping.entries66().len(),
            mapping.prefix()
        );
        Ok(())
    }

    /// Serve packets until SIGINT or SIGTERM. SIGHUP reloads the
    /// configuration.
    pub async fn run(mut self) -> Result<(), NetError> {
        let mut hangup = signal(SignalKind::hangup())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        let (tx, mut rx) = mpsc::channel(4);
        let forwarder = tokio::spawn(async move {
            loop {
                let control = tokio::select! {
                    _ = hangup.recv() => Control::Reload,
                    _ = interrupt.recv() => Control::Shutdown,
                    _ = terminate.recv() => Control::Shutdown,
                };
                if tx.send(control).await.is_err() {
                    break;
                }
            }
        });

        let result = self.serve(&mut rx).await;
        forwarder.abort();
        result
    }

    /// Packet loop. Control requests are handled before the next packet is
    /// read; a closed control channel stops the loop like
    /// [`Control::Shutdown`].
    pub async fn serve(&mut self, control: &mut mpsc::Receiver<Control>) -> Result<(), NetError> {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        loop {
            tokio::select! {
                biased;

                request = control.recv() => match request {
                    Some(Control::Reload) => {
                        if let Err(e) = self.reload() {
                            error!("reload failed: {e}");
                            self.shutdown();
                            return Err(e);
                        }
                    }
                    Some(Control::Shutdown) | None => {
                        info!("shutting down");
                        self.shutdown();
                        return Ok(());
                    }
                },

                received = poll_fn(|cx| self.io.poll_recv(cx, &mut buf)) => match received {
                    Ok((family, len)) => self.handle_packet(family, &buf[..len]),
                    Err(e) => {
                        error!("packet read failed: {e}");
                        self.shutdown();
                        return Err(e.into());
                    }
                },
            }
        }
    }

    fn handle_packet(&mut self, family: AddressFamily, packet: &[u8]) {
        for out in self.translator.translate(family, packet) {
            if let Err(e) = self.io.send(&out) {
                warn!("failed to write {} packet: {e}", out.family);
            }
        }
    }
}
