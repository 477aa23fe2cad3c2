//! The set of live simulator circuits, keyed by region handle, with a
//! "current" pointer for the region the agent is standing in.

use crate::circuit::{Circuit, CircuitConfig, CircuitParams, CircuitState};
use crate::error::{CircuitError, Result};
use crate::events::{EventHub, Subscription};
use crate::protocol::messages::Message;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An inbound message tagged with the region it came from.
#[derive(Clone)]
pub struct SimEvent {
    pub region_handle: u64,
    pub message: Arc<Message>,
}

/// Owns every live circuit. Neighboring regions keep their circuits open
/// until the liveness sweep retires them.
pub struct CircuitManager {
    cfg: CircuitConfig,
    circuits: DashMap<u64, Arc<Circuit>>,
    /// Region handle of the current simulator; 0 = none.
    current: AtomicU64,
    events: EventHub<SimEvent>,
}

impl CircuitManager {
    pub fn new(cfg: CircuitConfig) -> Self {
        Self {
            cfg,
            circuits: DashMap::new(),
            current: AtomicU64::new(0),
            events: EventHub::new(),
        }
    }

    /// Opens a circuit to a new region and runs the handshake. With
    /// `make_current` the pointer moves to it (the usual case for the
    /// region the agent teleports into; neighbors pass `false`).
    pub async fn connect(
        &self,
        params: CircuitParams,
        move_to_sim: bool,
        make_current: bool,
    ) -> Result<Arc<Circuit>> {
        if let Some(existing) = self.circuits.get(&params.region_handle) {
            debug!(
                "Reusing existing circuit for region handle {}",
                params.region_handle
            );
            return Ok(Arc::clone(existing.value()));
        }

        let circuit = Circuit::open(self.cfg.clone(), params).await?;
        self.spawn_forwarder(&circuit);
        self.circuits
            .insert(params.region_handle, Arc::clone(&circuit));

        if let Err(e) = circuit.connect(move_to_sim).await {
            self.circuits.remove(&params.region_handle);
            circuit.close(false).await;
            return Err(e);
        }

        if make_current {
            self.set_current(params.region_handle);
        }
        info!(
            "Connected to region handle {} at {}",
            params.region_handle,
            circuit.remote()
        );
        Ok(circuit)
    }

    /// Re-publishes one circuit's inbound messages onto the merged bus.
    fn spawn_forwarder(&self, circuit: &Arc<Circuit>) {
        let mut sub = circuit.subscribe();
        let region_handle = circuit.region_handle();
        let hub = self.events.clone();
        tokio::spawn(async move {
            while let Some(message) = sub.recv().await {
                hub.publish(SimEvent {
                    region_handle,
                    message,
                });
            }
        });
    }

    pub fn get(&self, region_handle: u64) -> Option<Arc<Circuit>> {
        self.circuits
            .get(&region_handle)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn set_current(&self, region_handle: u64) {
        self.current.store(region_handle, Ordering::Release);
        debug!("Current region is now handle {}", region_handle);
    }

    pub fn current(&self) -> Option<Arc<Circuit>> {
        let handle = self.current.load(Ordering::Acquire);
        if handle == 0 { None } else { self.get(handle) }
    }

    /// Sends to a specific region's circuit.
    pub async fn send_to(
        &self,
        region_handle: u64,
        message: Message,
        reliable: bool,
        zerocoded: bool,
    ) -> Result<()> {
        let circuit = self
            .get(region_handle)
            .ok_or(CircuitError::UnknownRegion(region_handle))?;
        circuit.send(message, reliable, zerocoded).await
    }

    /// Merged event stream across every live circuit.
    pub fn subscribe(&self) -> Subscription<SimEvent> {
        self.events.subscribe()
    }

    pub async fn disconnect(&self, region_handle: u64, send_close_circuit: bool) -> Result<()> {
        let (_, circuit) = self
            .circuits
            .remove(&region_handle)
            .ok_or(CircuitError::UnknownRegion(region_handle))?;
        circuit.close(send_close_circuit).await;
        let _ = self.current.compare_exchange(
            region_handle,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Drops circuits whose liveness sweep already disconnected them.
    pub fn reap_disconnected(&self) {
        let dead: Vec<u64> = self
            .circuits
            .iter()
            .filter(|entry| entry.value().state() == CircuitState::Disconnected)
            .map(|entry| *entry.key())
            .collect();
        for handle in dead {
            warn!("Reaping disconnected circuit for region handle {}", handle);
            self.circuits.remove(&handle);
            let _ = self
                .current
                .compare_exchange(handle, 0, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    pub async fn disconnect_all(&self, send_close_circuit: bool) {
        let handles: Vec<u64> = self.circuits.iter().map(|entry| *entry.key()).collect();
        for handle in handles {
            if let Some((_, circuit)) = self.circuits.remove(&handle) {
                circuit.close(send_close_circuit).await;
            }
        }
        self.current.store(0, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }
}
