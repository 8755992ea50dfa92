//! This module defines the `RuntimeBuilder` used to configure the calling
//! thread's hub, and the `Handle` returned for driving fibers on it.
//!
//! The runtime is single threaded: one hub per OS thread, fibers never leave
//! the thread that spawned them.

use std::{future::Future, rc::Rc};

use crate::{
    engine::DEFAULT_EVENTS_CAPACITY,
    error::HubError,
    hub::{Hub, HubConfig},
    spawner::JoinHandle,
};

/// Builder for creating and configuring the thread's hub.
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    config: HubConfig,
}

impl RuntimeBuilder {
    /// Creates a new `RuntimeBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            config: HubConfig {
                events_capacity: DEFAULT_EVENTS_CAPACITY,
                catch_interrupt: true,
            },
        }
    }

    /// Sets how many readiness events one poll of the loop may return.
    pub fn events_capacity(mut self, events_capacity: usize) -> Self {
        self.config.events_capacity = events_capacity;
        self
    }

    /// Whether SIGINT aborts [`Handle::block_on`] with [`HubError::Interrupted`].
    pub fn catch_interrupt(mut self, catch_interrupt: bool) -> Self {
        self.config.catch_interrupt = catch_interrupt;
        self
    }

    /// Builds the hub, installs it as the calling thread's hub and returns a
    /// handle to it.
    pub fn build(self) -> Result<Handle, HubError> {
        let hub = Hub::install(&self.config)?;
        Ok(Handle { hub })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for interacting with a thread's hub.
#[derive(Debug, Clone)]
pub struct Handle {
    hub: Rc<Hub>,
}

impl Handle {
    /// Handle to the calling thread's hub, creating one with default settings
    /// if needed.
    pub fn current() -> Self {
        Self {
            hub: Hub::current(),
        }
    }

    /// Runs the hub until `future` completes.
    pub fn block_on<Fut, T>(&self, future: Fut) -> Result<T, HubError>
    where
        T: 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.hub.block_on(future)
    }

    /// Spawns a fiber on the hub.
    pub fn spawn<Fut, T>(&self, future: Fut) -> JoinHandle<T>
    where
        T: 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.hub.spawn(future)
    }

    pub fn spawn_n<Fut>(&self, future: Fut)
    where
        Fut: Future<Output = ()> + 'static,
    {
        self.hub.spawn_n(future)
    }

    pub fn hub(&self) -> &Rc<Hub> {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use super::*;
    use crate::time::sleep;

    async fn increment(ctr: Rc<Cell<u8>>) {
        ctr.set(ctr.get() + 1);
    }

    #[test]
    fn test_runtime_builder_default() {
        let builder = RuntimeBuilder::default();
        assert_eq!(builder.config.events_capacity, DEFAULT_EVENTS_CAPACITY);
        assert!(builder.config.catch_interrupt);
    }

    #[test]
    fn test_runtime_builder_settings() {
        let builder = RuntimeBuilder::default()
            .events_capacity(16)
            .catch_interrupt(false);
        assert_eq!(
            builder.config,
            HubConfig {
                events_capacity: 16,
                catch_interrupt: false,
            }
        );
    }

    #[test]
    fn test_build_installs_thread_hub() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        assert_eq!(handle.hub().id(), Handle::current().hub().id());
    }

    #[test]
    fn test_block_on() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let ctr = Rc::new(Cell::new(0));
        handle.block_on(increment(Rc::clone(&ctr))).unwrap();
        assert_eq!(ctr.get(), 1);
    }

    #[test]
    fn test_block_on_return() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();

        let ctr = 1;
        let res = handle.block_on(async move { ctr + 1 }).unwrap();

        assert_eq!(res, 2)
    }

    #[test]
    fn test_block_on_twice() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        handle
            .block_on(sleep(Duration::from_millis(5)))
            .unwrap()
            .unwrap();
        let res = handle.block_on(async { "again" }).unwrap();
        assert_eq!(res, "again");
    }

    #[test]
    fn test_nested_block_on_is_rejected() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let res = handle
            .block_on(async {
                let inner = Handle::current();
                inner.block_on(async {}).map(|_| ())
            })
            .unwrap();
        assert!(matches!(res, Err(HubError::AlreadyRunning)));
    }
}
