//! Batch routing: one render process serving several simulation sources
//!
//! The router pre-allocates the ports the producers must bind, hosts one
//! consumer mirror per source, and keeps every source synchronizing in the
//! background while exactly one is attached to the display surface. Sources
//! are mutually isolated: a crashed or stalled producer takes down its own
//! mirror and nothing else.

use crate::consumer::{Consumer, ConsumerConfig, ExitWatch};
use crate::error::{Result, SimlinkError};
use log::{debug, warn};
use std::net::TcpListener;

/// Discover `n` free loopback ports by binding and immediately releasing
/// throwaway listeners
///
/// The ports are handed out of band to independently launched producers,
/// which must bind them as their batch keys. The window between release and
/// rebind is unguarded; loopback port churn makes a collision unlikely
/// enough for interactive use.
pub fn allocate_ports(n: usize) -> Result<Vec<u16>> {
    let mut listeners = Vec::with_capacity(n);
    for _ in 0..n {
        listeners.push(TcpListener::bind(("127.0.0.1", 0))?);
    }
    listeners
        .iter()
        .map(|l| Ok(l.local_addr()?.port()))
        .collect()
}

/// The render boundary: whatever actually draws the objects
///
/// The router never touches graphics state itself; it only tells the
/// surface which source's object ids should currently be drawn.
pub trait Surface {
    fn attach(&mut self, source: usize, object_ids: &[usize]);
    fn detach(&mut self, source: usize, object_ids: &[usize]);
}

struct BatchSource {
    consumer: Consumer,
    watch: ExitWatch,
    alive: bool,
}

/// N producer/consumer pairs behind one display surface
pub struct BatchRouter {
    sources: Vec<BatchSource>,
    active: usize,
}

impl BatchRouter {
    /// Connect one consumer mirror per port and start its exit watcher
    pub fn connect(ports: &[u16], config: ConsumerConfig) -> Result<Self> {
        let mut sources = Vec::with_capacity(ports.len());
        for &port in ports {
            let consumer = Consumer::connect(port, config.clone())?;
            let watch = consumer.watch_exit();
            sources.push(BatchSource {
                consumer,
                watch,
                alive: true,
            });
        }
        debug!("batch router connected {} sources", sources.len());
        Ok(Self { sources, active: 0 })
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn consumer(&self, source: usize) -> Result<&Consumer> {
        self.sources
            .get(source)
            .map(|s| &s.consumer)
            .ok_or(SimlinkError::UnknownSource(source))
    }

    /// Hand a source's drawable objects to the surface
    pub fn attach(&self, source: usize, surface: &mut dyn Surface) -> Result<()> {
        surface.attach(source, &self.object_ids(source)?);
        Ok(())
    }

    /// Take a source's drawable objects off the surface
    pub fn detach(&self, source: usize, surface: &mut dyn Surface) -> Result<()> {
        surface.detach(source, &self.object_ids(source)?);
        Ok(())
    }

    /// Switch the displayed source
    ///
    /// Detaches exactly the previously active source's objects and attaches
    /// the new source's. No source's synchronization pauses or resets.
    pub fn set_active(&mut self, source: usize, surface: &mut dyn Surface) -> Result<()> {
        if source >= self.sources.len() {
            return Err(SimlinkError::UnknownSource(source));
        }
        if source != self.active {
            self.detach(self.active, surface)?;
            self.attach(source, surface)?;
            self.active = source;
        }
        Ok(())
    }

    /// Tick every live source once; returns true if the active source
    /// applied a new frame
    ///
    /// A source whose producer has requested exit (or whose control socket
    /// failed) is shut down individually and marked dead; the others keep
    /// routing.
    pub fn tick_all(&mut self) -> bool {
        let mut active_advanced = false;
        for (index, source) in self.sources.iter_mut().enumerate() {
            if !source.alive {
                continue;
            }
            if source.watch.exit_requested() {
                if let Err(e) = source.consumer.shutdown() {
                    warn!("batch source {index} shutdown failed: {e}");
                }
                source.alive = false;
                continue;
            }
            match source.consumer.frame_tick() {
                Ok(advanced) => {
                    if index == self.active {
                        active_advanced = advanced;
                    }
                }
                Err(e) => {
                    warn!("batch source {index} failed, detaching it: {e}");
                    source.alive = false;
                }
            }
        }
        active_advanced
    }

    /// True while the source's session is still exchanging frames
    pub fn is_alive(&self, source: usize) -> bool {
        self.sources.get(source).is_some_and(|s| s.alive && s.consumer.is_open())
    }

    /// Tear every remaining source down individually
    pub fn shutdown(&mut self) {
        for (index, source) in self.sources.iter_mut().enumerate() {
            if !source.alive {
                continue;
            }
            if let Err(e) = source.consumer.shutdown() {
                warn!("batch source {index} shutdown failed: {e}");
            }
            source.alive = false;
        }
    }

    fn object_ids(&self, source: usize) -> Result<Vec<usize>> {
        let consumer = self.consumer(source)?;
        Ok((0..consumer.object_count()).collect())
    }
}
