use burn::nn::{
    Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig, Relu,
};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;

/// Dueling Q-network for the tile-game action space.
///
/// ```text
/// Input:  [batch, input_dim]
/// Trunk:  Linear(input_dim -> H) -> LayerNorm -> ReLU -> Dropout
/// Res x2: Linear(H -> H) -> LayerNorm -> ReLU -> Dropout
///         -> Linear(H -> H) -> LayerNorm, added to block input, ReLU
/// Value:     Linear(H -> H/2) -> ReLU -> Linear(H/2 -> 1)
/// Advantage: Linear(H -> H/2) -> ReLU -> Linear(H/2 -> N)
/// Output: Q = V + (A - mean(A))    [batch, N]
/// ```
///
/// The advantage mean-subtraction keeps V and A identifiable from Q. Dropout
/// is only active on the autodiff backend, so inference through `valid()` is
/// deterministic.
#[derive(Module, Debug)]
pub struct QNetwork<B: Backend> {
    input: Linear<B>,
    input_norm: LayerNorm<B>,
    dropout: Dropout,
    res1: ResidualBlock<B>,
    res2: ResidualBlock<B>,
    value_fc: Linear<B>,
    value_out: Linear<B>,
    advantage_fc: Linear<B>,
    advantage_out: Linear<B>,
    relu: Relu,
}

/// One pre-activation residual refinement block over the trunk width.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    fc1: Linear<B>,
    norm1: LayerNorm<B>,
    dropout: Dropout,
    fc2: Linear<B>,
    norm2: LayerNorm<B>,
    relu: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.norm1.forward(self.fc1.forward(input.clone())));
        let x = self.dropout.forward(x);
        let x = self.norm2.forward(self.fc2.forward(x));
        self.relu.forward(input + x)
    }
}

#[derive(Config, Debug)]
pub struct QNetworkConfig {
    /// Observation vector length.
    #[config(default = 3185)]
    pub input_dim: usize,
    /// Trunk width.
    #[config(default = 512)]
    pub hidden_dim: usize,
    /// Flat action space size.
    #[config(default = 137)]
    pub num_actions: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
}

impl QNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> QNetwork<B> {
        let h = self.hidden_dim;
        QNetwork {
            input: LinearConfig::new(self.input_dim, h).init(device),
            input_norm: LayerNormConfig::new(h).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            res1: self.residual_block(device),
            res2: self.residual_block(device),
            value_fc: LinearConfig::new(h, h / 2).init(device),
            value_out: LinearConfig::new(h / 2, 1).init(device),
            advantage_fc: LinearConfig::new(h, h / 2).init(device),
            advantage_out: LinearConfig::new(h / 2, self.num_actions).init(device),
            relu: Relu::new(),
        }
    }

    fn residual_block<B: Backend>(&self, device: &B::Device) -> ResidualBlock<B> {
        let h = self.hidden_dim;
        ResidualBlock {
            fc1: LinearConfig::new(h, h).init(device),
            norm1: LayerNormConfig::new(h).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(h, h).init(device),
            norm2: LayerNormConfig::new(h).init(device),
            relu: Relu::new(),
        }
    }
}

impl Default for QNetworkConfig {
    fn default() -> Self {
        QNetworkConfig::new()
    }
}

impl<B: Backend> QNetwork<B> {
    /// Forward pass: input `[batch, input_dim]` -> Q-values `[batch, num_actions]`.
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.input_norm.forward(self.input.forward(input)));
        let x = self.dropout.forward(x);
        let x = self.res1.forward(x);
        let x = self.res2.forward(x);

        let value = self
            .value_out
            .forward(self.relu.forward(self.value_fc.forward(x.clone()))); // [batch, 1]
        let advantage = self
            .advantage_out
            .forward(self.relu.forward(self.advantage_fc.forward(x))); // [batch, N]

        let advantage_mean = advantage.clone().mean_dim(1); // [batch, 1]
        value + (advantage - advantage_mean)
    }
}

fn grad_sq<B: AutodiffBackend, const D: usize>(tensor: &Tensor<B, D>, grads: &B::Gradients) -> f64 {
    match tensor.grad(grads) {
        Some(grad) => {
            let sq: f32 = (grad.clone() * grad).sum().into_scalar().elem();
            f64::from(sq)
        }
        None => 0.0,
    }
}

fn scale_grad<B: AutodiffBackend, const D: usize>(
    tensor: &Tensor<B, D>,
    grads: &mut B::Gradients,
    factor: f32,
) {
    if let Some(grad) = tensor.grad_remove(grads) {
        tensor.grad_replace(grads, grad * factor);
    }
}

impl<B: AutodiffBackend> QNetwork<B> {
    fn linears(&self) -> [&Linear<B>; 9] {
        [
            &self.input,
            &self.res1.fc1,
            &self.res1.fc2,
            &self.res2.fc1,
            &self.res2.fc2,
            &self.value_fc,
            &self.value_out,
            &self.advantage_fc,
            &self.advantage_out,
        ]
    }

    fn norms(&self) -> [&LayerNorm<B>; 5] {
        [
            &self.input_norm,
            &self.res1.norm1,
            &self.res1.norm2,
            &self.res2.norm1,
            &self.res2.norm2,
        ]
    }

    /// Global L2 norm over all parameter gradients after a backward pass.
    pub fn grad_norm(&self, grads: &B::Gradients) -> f32 {
        let mut sum_sq = 0.0f64;
        for linear in self.linears() {
            sum_sq += grad_sq(&linear.weight.val(), grads);
            if let Some(bias) = &linear.bias {
                sum_sq += grad_sq(&bias.val(), grads);
            }
        }
        for norm in self.norms() {
            sum_sq += grad_sq(&norm.gamma.val(), grads);
            sum_sq += grad_sq(&norm.beta.val(), grads);
        }
        (sum_sq as f32).sqrt()
    }

    /// Rescale all parameter gradients by one shared factor so their global
    /// L2 norm does not exceed `max_norm`. Returns the norm before scaling.
    pub fn clip_grad_norm(&self, grads: &mut B::Gradients, max_norm: f32) -> f32 {
        let norm = self.grad_norm(grads);
        if norm > max_norm && norm.is_finite() {
            let factor = max_norm / norm;
            for linear in self.linears() {
                scale_grad(&linear.weight.val(), grads, factor);
                if let Some(bias) = &linear.bias {
                    scale_grad(&bias.val(), grads, factor);
                }
            }
            for norm_layer in self.norms() {
                scale_grad(&norm_layer.gamma.val(), grads, factor);
                scale_grad(&norm_layer.beta.val(), grads, factor);
            }
        }
        norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NUM_ACTIONS;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn small_config() -> QNetworkConfig {
        QNetworkConfig::new()
            .with_input_dim(16)
            .with_hidden_dim(32)
            .with_num_actions(137)
    }

    #[test]
    fn test_network_output_shape() {
        let device = Default::default();
        let network = small_config().init::<TestBackend>(&device);

        let input = Tensor::zeros([2, 16], &device);
        let output = network.forward(input);
        assert_eq!(output.shape().dims, [2, 137]);
    }

    #[test]
    fn test_network_single_input() {
        let device = Default::default();
        let network = small_config().init::<TestBackend>(&device);

        let input = Tensor::zeros([1, 16], &device);
        let output = network.forward(input);
        assert_eq!(output.shape().dims, [1, 137]);
    }

    #[test]
    fn test_network_output_is_finite() {
        let device = Default::default();
        let network = small_config().init::<TestBackend>(&device);

        let input = Tensor::ones([1, 16], &device);
        let q: Vec<f32> = network.forward(input).into_data().to_vec().unwrap();
        assert_eq!(q.len(), 137);
        assert!(q.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_clip_grad_norm_bounds_global_norm() {
        let device = Default::default();
        let network: QNetwork<TestAutodiffBackend> = small_config().init(&device);

        // Inflate the loss so the gradient norm comfortably exceeds the bound.
        let input = Tensor::ones([4, 16], &device);
        let loss = network.forward(input).sum() * 1000.0;
        let mut grads = loss.backward();

        let before = network.grad_norm(&grads);
        assert!(before > 1.0, "expected a large gradient norm, got {before}");

        let reported = network.clip_grad_norm(&mut grads, 1.0);
        assert!((reported - before).abs() < before * 1e-4);

        // One shared factor brings the global norm down to the bound exactly.
        let after = network.grad_norm(&grads);
        assert!((after - 1.0).abs() < 1e-3, "clipped global norm is {after}");
    }

    #[test]
    fn test_clip_grad_norm_noop_below_threshold() {
        let device = Default::default();
        let network: QNetwork<TestAutodiffBackend> = small_config().init(&device);

        let input = Tensor::ones([1, 16], &device);
        let loss = network.forward(input).sum();
        let mut grads = loss.backward();

        let before = network.grad_norm(&grads);
        network.clip_grad_norm(&mut grads, 1e9);
        let after = network.grad_norm(&grads);
        assert!((after - before).abs() < before.max(1e-6) * 1e-5);
    }

    #[test]
    fn test_default_config_matches_action_space() {
        let config = QNetworkConfig::default();
        assert_eq!(config.input_dim, 3185);
        assert_eq!(config.hidden_dim, 512);
        assert_eq!(config.num_actions, NUM_ACTIONS);
    }
}
