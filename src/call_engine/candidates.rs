//! Puffer für ICE Candidates die vor der Remote Description eintreffen

use super::engine::IceCandidate;

/// FIFO-Puffer für verfrühte Remote Candidates
///
/// Signaling und Description-Austausch laufen unabhängig voneinander, daher
/// kann ein Candidate der Gegenseite vor ihrem Offer/Answer ankommen. Solche
/// Candidates werden hier in Ankunftsreihenfolge gehalten und nach dem Setzen
/// der Remote Description genau einmal abgespielt.
#[derive(Debug, Default)]
pub struct PendingCandidateBuffer {
    queue: Vec<IceCandidate>,
}

impl PendingCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hängt einen Candidate an
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push(candidate);
    }

    /// Gibt alle Candidates zurück und leert den Puffer, aber nur wenn
    /// bereits eine Remote Description gesetzt ist
    pub fn drain_if_ready(&mut self, has_remote_description: bool) -> Vec<IceCandidate> {
        if !has_remote_description {
            return Vec::new();
        }
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn test_drain_without_description_keeps_buffer() {
        let mut buffer = PendingCandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.push(candidate(2));

        assert!(buffer.drain_if_ready(false).is_empty());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_drain_preserves_arrival_order() {
        let mut buffer = PendingCandidateBuffer::new();
        for n in [3, 1, 2] {
            buffer.push(candidate(n));
        }

        let drained = buffer.drain_if_ready(true);
        assert_eq!(drained, vec![candidate(3), candidate(1), candidate(2)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_second_drain_is_empty() {
        let mut buffer = PendingCandidateBuffer::new();
        buffer.push(candidate(1));

        assert_eq!(buffer.drain_if_ready(true).len(), 1);
        assert!(buffer.drain_if_ready(true).is_empty());
    }
}
