use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::select;
use tracing::{info, warn};

use transport::demux::Demultiplexer;
use transport::packet_io::PacketIo;

use crate::boundary::{CertificateCheck, EventSink, FriendDirectory, NoticeKind, TcpConnector};
use crate::config::NodeConfig;
use crate::events::{CoreEvent, CoreEventNotifier};
use crate::probe::{ConnectionStatus, ConnectivityProbe};
use crate::scheduler::PeerScheduler;
use crate::transfer::TransferModule;

/// One running peer: two bound UDP sockets and the modules wired on top of them.
///
/// The main socket carries all friend traffic; the secondary socket exists only for the
///  reachability probe, which needs a second local port to compare NAT mappings against.
///  Failing to bind either socket is the only error that keeps a node from starting at all.
pub struct PeerNode {
    main_demux: Arc<Demultiplexer>,
    test_demux: Arc<Demultiplexer>,

    probe: Arc<ConnectivityProbe>,
    scheduler: Arc<PeerScheduler>,
    transfers: Arc<TransferModule>,

    events: Arc<CoreEventNotifier>,
    sink: Arc<dyn EventSink>,
}

impl PeerNode {
    pub async fn new(
        config: &NodeConfig,
        directory: Arc<dyn FriendDirectory>,
        certs: Arc<dyn CertificateCheck>,
        tcp: Arc<dyn TcpConnector>,
        sink: Arc<dyn EventSink>,
    ) -> anyhow::Result<PeerNode> {
        let main_io = Arc::new(PacketIo::bind(config.main_addr).await
            .with_context(|| format!("binding the main socket to {}", config.main_addr))?);
        let test_io = Arc::new(PacketIo::bind(config.test_addr).await
            .with_context(|| format!("binding the probe socket to {}", config.test_addr))?);
        info!("peer node up: main port {}, probe port {}", main_io.local_port(), test_io.local_port());

        let main_demux = Demultiplexer::new(main_io);
        let test_demux = Demultiplexer::new(test_io.clone());

        let events = Arc::new(CoreEventNotifier::new());

        let probe = ConnectivityProbe::new(config, main_demux.clone(), test_io, directory.clone(), events.clone());
        // binding responses can arrive on either socket
        main_demux.set_stun_handler(probe.clone()).await;
        test_demux.set_stun_handler(probe.clone()).await;

        let scheduler = PeerScheduler::new(config, main_demux.clone(), probe.clone(), directory, certs, tcp, events.clone());
        main_demux.set_control_handler(scheduler.clone()).await;

        Ok(PeerNode {
            main_demux,
            test_demux,
            probe,
            scheduler,
            transfers: Arc::new(TransferModule::new()),
            events,
            sink,
        })
    }

    pub fn probe(&self) -> Arc<ConnectivityProbe> {
        self.probe.clone()
    }

    pub fn scheduler(&self) -> Arc<PeerScheduler> {
        self.scheduler.clone()
    }

    pub fn transfers(&self) -> Arc<TransferModule> {
        self.transfers.clone()
    }

    pub fn events(&self) -> Arc<CoreEventNotifier> {
        self.events.clone()
    }

    /// Drive the node. Never returns; cancel the future (or the surrounding task) to shut the
    ///  node down.
    pub async fn run(&self) {
        self.probe.start().await;
        self.scheduler.sync_friends().await;

        let main_io = self.main_demux.packet_io();
        let test_io = self.test_demux.packet_io();
        select! {
            _ = main_io.recv_loop(self.main_demux.clone()) => {}
            _ = test_io.recv_loop(self.test_demux.clone()) => {}
            _ = self.tick_loop() => {}
            _ = self.event_loop() => {}
        }
    }

    async fn tick_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            self.probe.tick().await;
            self.scheduler.tick().await;
            self.main_demux.tick().await;
            self.test_demux.tick().await;
            self.transfers.tick().await;
        }
    }

    /// Internal event plumbing: transfers learn about friend connectivity from scheduler
    ///  events rather than by polling, and probe verdicts worth the user's attention are
    ///  passed on to the application's sink.
    async fn event_loop(&self) {
        let mut events = self.events.subscribe();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(e) => {
                    // lagging only drops events for this consumer; transfers recover on the
                    //  next online/offline edge
                    warn!("event subscription hiccup: {}", e);
                    continue;
                }
            };

            match event {
                CoreEvent::FriendOnline(friend_id) => self.transfers.on_peer_online(friend_id).await,
                CoreEvent::FriendOffline(friend_id) => self.transfers.on_peer_offline(friend_id).await,
                CoreEvent::ConnectionReady => {
                    self.sink.notify_system("network connectivity established").await;
                }
                CoreEvent::ConnectionStatusChanged { status, auto_configure } => {
                    match status {
                        ConnectionStatus::Unknown => {
                            self.sink.notify_popup(
                                NoticeKind::Warning,
                                "Limited connectivity",
                                "Reachability could not be determined. Connections to friends may be one-sided or fail; check the router's port forwarding.",
                            ).await;
                        }
                        ConnectionStatus::SymmetricNat if auto_configure => {
                            self.sink.notify_system("symmetric NAT detected, direct connections will be unreliable").await;
                        }
                        _ => {}
                    }
                }
                CoreEvent::FriendsChanged => {}
            }
        }
    }
}
