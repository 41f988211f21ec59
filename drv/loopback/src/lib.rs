// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loopback adapter: echoes every write back to the next read
//! (spec.md §8 S1; `loopback.py`). Used to exercise the VXI-11 façade
//! without a physical instrument.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use adapter::{Adapter, AdapterError};
use async_trait::async_trait;
use tokio::sync::Notify;

pub struct LoopbackAdapter {
    buffer: StdMutex<VecDeque<Vec<u8>>>,
    data_ready: Notify,
}

impl LoopbackAdapter {
    pub fn new() -> Self {
        Self { buffer: StdMutex::new(VecDeque::new()), data_ready: Notify::new() }
    }
}

impl Default for LoopbackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for LoopbackAdapter {
    async fn acquire(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn release(&self) {}

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
        self.buffer.lock().unwrap().push_back(data.to_vec());
        self.data_ready.notify_one();
        Ok(data.len())
    }

    /// Blocks until at least one write is buffered, then drains up to
    /// `max_bytes`, splitting a chunk if it straddles the boundary
    /// (`loopback.py:read`).
    async fn read(&self, max_bytes: usize) -> Result<Vec<u8>, AdapterError> {
        loop {
            // Register for notification before re-checking the buffer, so a
            // write landing between the check and the wait can't be missed
            // (the classic `Notify` lost-wakeup race).
            let notified = self.data_ready.notified();
            {
                let mut buffer = self.buffer.lock().unwrap();
                if !buffer.is_empty() {
                    let mut out = Vec::new();
                    let mut remaining = max_bytes;
                    while let Some(front) = buffer.pop_front() {
                        if remaining == 0 {
                            buffer.push_front(front);
                            break;
                        }
                        if front.len() <= remaining {
                            remaining -= front.len();
                            out.extend_from_slice(&front);
                        } else {
                            out.extend_from_slice(&front[..remaining]);
                            buffer.push_front(front[remaining..].to_vec());
                            remaining = 0;
                        }
                    }
                    return Ok(out);
                }
            }
            notified.await;
        }
    }

    fn requires_lock(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_echoes_exact_bytes() {
        let adapter = LoopbackAdapter::new();
        assert_eq!(adapter.write(b"hello").await.unwrap(), 5);
        let data = adapter.read(1024).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn read_splits_a_chunk_that_exceeds_the_request_size() {
        let adapter = LoopbackAdapter::new();
        adapter.write(b"abcdef").await.unwrap();
        assert_eq!(adapter.read(3).await.unwrap(), b"abc");
        assert_eq!(adapter.read(3).await.unwrap(), b"def");
    }

    #[tokio::test]
    async fn read_blocks_until_a_write_arrives() {
        let adapter = std::sync::Arc::new(LoopbackAdapter::new());
        let reader = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.read(16).await.unwrap() })
        };
        tokio::task::yield_now().await;
        adapter.write(b"late").await.unwrap();
        let data = reader.await.unwrap();
        assert_eq!(data, b"late");
    }

    #[test]
    fn requires_lock_is_true() {
        assert!(LoopbackAdapter::new().requires_lock());
    }
}
