use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;

/// One (state, action, reward, next_state, done) training sample. Owned by the
/// replay buffer once pushed; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: Vec<f32>,
    pub action: usize,
    pub reward: f32,
    /// `None` when the reporting side had no next observation. Materialized as
    /// an all-zero vector at batch time.
    pub next_state: Option<Vec<f32>>,
    pub done: bool,
}

/// Fixed-capacity ring buffer of transitions with uniform random sampling.
pub struct ReplayBuffer {
    buffer: Vec<Transition>,
    capacity: usize,
    position: usize,
    len: usize,
    rng: StdRng,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        ReplayBuffer {
            buffer: Vec::with_capacity(capacity),
            capacity,
            position: 0,
            len: 0,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Add a transition to the buffer. Overwrites the oldest when full.
    pub fn push(&mut self, transition: Transition) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(transition);
        } else {
            self.buffer[self.position] = transition;
        }
        self.position = (self.position + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
        }
    }

    /// Sample `batch_size` distinct transitions uniformly at random.
    pub fn sample(&mut self, batch_size: usize) -> Vec<Transition> {
        assert!(batch_size <= self.len, "Not enough transitions to sample");
        let indices = index::sample(&mut self.rng, self.len, batch_size);
        indices.iter().map(|i| self.buffer[i].clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
