use super::sample::OutgoingSample;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Called after every successful enqueue with the sample just queued
pub type AlteredProc = Box<dyn Fn(&Arc<OutgoingSample>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("output queue is full ({capacity} samples)")]
    Full { capacity: usize },
}

/// Bounded FIFO between the frame producer and the consumer
///
/// Never blocks and never evicts: enqueueing into a full queue is refused.
pub struct OutputQueue {
    items: Mutex<VecDeque<Arc<OutgoingSample>>>,
    capacity: usize,
    altered: RwLock<Option<AlteredProc>>,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            altered: RwLock::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Append a sample, returning the shared handle that was queued
    pub fn enqueue(&self, sample: OutgoingSample) -> Result<Arc<OutgoingSample>, EnqueueError> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(EnqueueError::Full {
                capacity: self.capacity,
            });
        }
        let sample = Arc::new(sample);
        items.push_back(Arc::clone(&sample));
        Ok(sample)
    }

    pub fn dequeue(&self) -> Option<Arc<OutgoingSample>> {
        self.items.lock().pop_front()
    }

    /// Register the consumer's notification, replacing any previous one
    ///
    /// The callback runs on the producer thread and must not register or
    /// clear callbacks itself.
    pub fn set_altered_proc<F>(&self, callback: F)
    where
        F: Fn(&Arc<OutgoingSample>) + Send + Sync + 'static,
    {
        *self.altered.write() = Some(Box::new(callback));
    }

    pub fn clear_altered_proc(&self) {
        self.altered.write().take();
    }

    /// Tell the consumer that `sample` was queued
    pub fn notify_altered(&self, sample: &Arc<OutgoingSample>) {
        if let Some(callback) = self.altered.read().as_ref() {
            callback(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::sample::TimeBase;
    use image::RgbImage;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn sample(sequence_number: u64) -> OutgoingSample {
        OutgoingSample {
            sequence_number,
            timing: TimeBase::for_frame_rate(60).timing_for(sequence_number),
            payload: Arc::new(RgbImage::new(2, 2)),
            placeholder: true,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = OutputQueue::new(4);
        for i in 0..3 {
            queue.enqueue(sample(i)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap().sequence_number, 0);
        assert_eq!(queue.dequeue().unwrap().sequence_number, 1);
        assert_eq!(queue.dequeue().unwrap().sequence_number, 2);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_full_queue_refuses_without_evicting() {
        let queue = OutputQueue::new(30);
        for i in 0..30 {
            assert!(queue.enqueue(sample(i)).is_ok());
        }
        assert!(queue.is_full());

        let err = queue.enqueue(sample(30)).unwrap_err();
        assert!(matches!(err, EnqueueError::Full { capacity: 30 }));
        assert_eq!(queue.len(), 30);
        assert_eq!(queue.dequeue().unwrap().sequence_number, 0);

        // Room again after the consumer reads
        assert!(queue.enqueue(sample(31)).is_ok());
    }

    #[test]
    fn test_altered_proc_receives_queued_sample() {
        let queue = OutputQueue::new(2);
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let seen_in_proc = Arc::clone(&seen);
        queue.set_altered_proc(move |sample| {
            seen_in_proc.store(sample.sequence_number, Ordering::SeqCst);
        });

        let handle = queue.enqueue(sample(7)).unwrap();
        queue.notify_altered(&handle);
        assert_eq!(seen.load(Ordering::SeqCst), 7);

        queue.clear_altered_proc();
        let handle = queue.enqueue(sample(8)).unwrap();
        queue.notify_altered(&handle);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
