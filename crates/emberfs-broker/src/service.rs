//! The broker service: worker pool and background threads.
//!
//! The service owns one dispatcher, a queue of inbound requests served by a
//! fixed pool of worker threads (recv, process, reply), and the two monitor
//! threads. Shutdown raises a terminate flag, closes the queue and joins
//! every thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::info;

use emberfs_proto::RequestEnvelope;

use crate::broadcast::Broadcaster;
use crate::caps::CapStore;
use crate::config::BrokerConfig;
use crate::dispatcher::{Dispatcher, Recycler};
use crate::flush::FlushTracker;
use crate::locks::LockMap;
use crate::monitor::{CapMonitor, HeartbeatMonitor};
use crate::namespace::MemoryNamespace;
use crate::quota::QuotaOracle;
use crate::registry::ClientRegistry;
use crate::transport::ClientTransport;
use crate::types::VirtualIdentity;

/// One inbound message queued for the worker pool.
pub struct InboundRequest {
    /// Transport identity of the sending connection.
    pub client_id: String,
    /// Decoded request or heartbeat.
    pub envelope: RequestEnvelope,
    /// Identity the request runs under, resolved by the transport layer.
    pub vid: VirtualIdentity,
}

/// The running broker.
pub struct BrokerService {
    dispatcher: Arc<Dispatcher>,
    caps: Arc<CapStore>,
    registry: Arc<ClientRegistry>,
    locks: Arc<LockMap>,
    cap_monitor: Arc<CapMonitor>,
    broadcaster: Broadcaster,
    queue: Sender<InboundRequest>,
    terminate: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl BrokerService {
    /// Build and start a broker over the given collaborators. The namespace
    /// must be loaded before the service starts; the transport should be
    /// closed only after [`BrokerService::stop`] returns.
    pub fn start(
        cfg: BrokerConfig,
        ns: Arc<MemoryNamespace>,
        quota: Arc<dyn QuotaOracle>,
        transport: Arc<dyn ClientTransport>,
        recycler: Option<Arc<dyn Recycler>>,
    ) -> Self {
        info!(workers = cfg.worker_threads, "starting fuse metadata broker");

        let caps = Arc::new(CapStore::new());
        let registry = Arc::new(ClientRegistry::new(&cfg));
        let locks = Arc::new(LockMap::new());
        let flush = Arc::new(FlushTracker::new(cfg.flush_ttl));
        let broadcaster = Broadcaster::new(
            Arc::clone(&caps),
            Arc::clone(&registry),
            Arc::clone(&transport),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            cfg.clone(),
            ns,
            Arc::clone(&quota),
            Arc::clone(&caps),
            Arc::clone(&registry),
            Arc::clone(&locks),
            Arc::clone(&flush),
            broadcaster.clone(),
            recycler,
        ));

        let terminate = Arc::new(AtomicBool::new(false));
        let (queue, rx) = channel::<InboundRequest>();
        let rx = Arc::new(Mutex::new(rx));
        let mut threads = Vec::new();

        for worker in 0..cfg.worker_threads.max(1) {
            let rx = Arc::clone(&rx);
            let dispatcher = Arc::clone(&dispatcher);
            let transport = Arc::clone(&transport);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("broker-worker-{worker}"))
                    .spawn(move || worker_loop(&rx, &dispatcher, transport.as_ref()))
                    .expect("spawn worker thread"),
            );
        }

        let hb_monitor = HeartbeatMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&locks),
            Arc::clone(&flush),
            broadcaster.clone(),
        );
        {
            let terminate = Arc::clone(&terminate);
            threads.push(
                std::thread::Builder::new()
                    .name("broker-heartbeat".to_string())
                    .spawn(move || hb_monitor.run(&terminate))
                    .expect("spawn heartbeat monitor"),
            );
        }

        let cap_monitor = Arc::new(CapMonitor::new(
            &cfg,
            Arc::clone(&caps),
            quota,
            broadcaster.clone(),
        ));
        {
            let cap_monitor = Arc::clone(&cap_monitor);
            let terminate = Arc::clone(&terminate);
            threads.push(
                std::thread::Builder::new()
                    .name("broker-caps".to_string())
                    .spawn(move || cap_monitor.run(&terminate))
                    .expect("spawn cap monitor"),
            );
        }

        Self {
            dispatcher,
            caps,
            registry,
            locks,
            cap_monitor,
            broadcaster,
            queue,
            terminate,
            threads,
        }
    }

    /// Queue one inbound message for the worker pool.
    pub fn submit(&self, request: InboundRequest) {
        // a closed queue means the service is stopping
        let _ = self.queue.send(request);
    }

    /// The dispatcher, for in-process callers and tests.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Push a new heartbeat interval to every client.
    pub fn set_heartbeat_interval(&self, secs: u64) {
        self.dispatcher.set_heartbeat_interval(secs);
    }

    /// Change the cadence of the quota sweep.
    pub fn set_quota_check_interval(&self, ticks: u64) {
        self.cap_monitor.set_quota_check_interval(ticks);
    }

    /// Send an eviction notice to one mount (operator command).
    pub fn evict(&self, uuid: &str, reason: &str) -> bool {
        self.broadcaster.evict(uuid, reason)
    }

    /// Drop every cap of one mount and ask it to release them.
    pub fn dropcaps(&self, uuid: &str) -> usize {
        self.broadcaster.drop_client_caps(uuid)
    }

    /// Session and capability state for the operator console.
    pub fn dump(&self) -> String {
        let now = crate::types::Timestamp::now();
        let mut out = self.registry.dump(now);
        out.push_str(&self.caps.dump(now, None));
        out
    }

    /// Number of registered client sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of live capabilities.
    pub fn cap_count(&self) -> usize {
        self.caps.len()
    }

    /// Number of inodes carrying byte-range locks.
    pub fn locked_inode_count(&self) -> usize {
        self.locks.len()
    }

    /// Stop the workers and monitors and wait for them.
    pub fn stop(mut self) {
        info!("stopping fuse metadata broker");
        self.terminate.store(true, Ordering::Relaxed);
        drop(self.queue);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    rx: &Mutex<Receiver<InboundRequest>>,
    dispatcher: &Dispatcher,
    transport: &dyn ClientTransport,
) {
    loop {
        let request = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        let Ok(request) = request else {
            // queue closed: service shutdown
            return;
        };
        if let Some(reply) =
            dispatcher.handle_envelope(&request.client_id, request.envelope, &request.vid)
        {
            transport.reply(&request.client_id, &reply);
        }
    }
}
