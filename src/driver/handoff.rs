//! Frame slab hand-off between the generator and vsync threads.
//!
//! Implemented as a pair of bounded channels of capacity one: one
//! carries owned frame slabs downstream, the other returns drained
//! frame buffers for reuse. Each end therefore exclusively owns
//! whatever slab it currently holds, and either side disconnecting
//! unblocks the other.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::update::Update;

/// A batch of generated frames on its way to the panel.
pub(crate) struct FrameSlab {
    /// Frame contents, each `frame_size` bytes.
    pub frames: Vec<Vec<u8>>,

    /// Set on the last slab of an update: the record to finalize after
    /// its frames have reached the panel.
    pub finalize: Option<Update>,
}

/// Generator-side endpoint.
pub(crate) struct SlabSender {
    slabs: Sender<FrameSlab>,
    drained: Receiver<Vec<Vec<u8>>>,
}

/// Vsync-side endpoint.
pub(crate) struct SlabReceiver {
    slabs: Receiver<FrameSlab>,
    drained: Sender<Vec<Vec<u8>>>,
}

/// Raised when the peer thread has exited.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Disconnected;

pub(crate) fn slab_channel() -> (SlabSender, SlabReceiver) {
    let (slab_tx, slab_rx) = bounded(1);
    let (drained_tx, drained_rx) = bounded(1);

    (
        SlabSender {
            slabs: slab_tx,
            drained: drained_rx,
        },
        SlabReceiver {
            slabs: slab_rx,
            drained: drained_tx,
        },
    )
}

impl SlabSender {
    /// Hand a slab to the vsync thread, waiting until it has consumed
    /// the previous one.
    pub fn send(&self, slab: FrameSlab) -> Result<(), Disconnected> {
        self.slabs.send(slab).map_err(|_| Disconnected)
    }

    /// Reclaim frame buffers drained by the vsync thread, if any.
    pub fn reclaim(&self) -> Vec<Vec<u8>> {
        self.drained.try_recv().unwrap_or_default()
    }
}

impl SlabReceiver {
    /// Wait for the next slab, up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<FrameSlab, RecvTimeoutError> {
        self.slabs.recv_timeout(timeout)
    }

    /// Wait for the next slab indefinitely.
    pub fn recv(&self) -> Result<FrameSlab, Disconnected> {
        self.slabs.recv().map_err(|_| Disconnected)
    }

    /// Return drained frame buffers to the generator for reuse.
    ///
    /// Dropped on the floor if the generator is not ready for them;
    /// they were only an allocation-reuse optimization.
    pub fn give_back(&self, frames: Vec<Vec<u8>>) {
        if let Err(TrySendError::Full(_)) = self.drained.try_send(frames) {
            // Generator still holds a previous batch; let this one drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slabs_flow_downstream_and_buffers_flow_back() {
        let (sender, receiver) = slab_channel();

        sender
            .send(FrameSlab {
                frames: vec![vec![1, 2, 3]],
                finalize: None,
            })
            .unwrap();

        let slab = receiver.recv().unwrap();
        assert_eq!(slab.frames.len(), 1);
        receiver.give_back(slab.frames);

        let reclaimed = sender.reclaim();
        assert_eq!(reclaimed.len(), 1);
        // Nothing left to reclaim
        assert!(sender.reclaim().is_empty());
    }

    #[test]
    fn dropping_the_receiver_disconnects_the_sender() {
        let (sender, receiver) = slab_channel();
        drop(receiver);

        let result = sender.send(FrameSlab {
            frames: Vec::new(),
            finalize: None,
        });
        assert_eq!(result, Err(Disconnected));
    }

    #[test]
    fn receive_times_out_when_no_slab_is_pending() {
        let (_sender, receiver) = slab_channel();
        assert!(matches!(
            receiver.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        ));
    }
}
