use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Dropout, VarBuilder};
use careamics_config::SupportedActivation;

/// Elementwise nonlinearity named in the model configuration
#[derive(Clone, Copy, Debug)]
pub struct Nonlinearity(pub SupportedActivation);

impl Module for Nonlinearity {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self.0 {
            SupportedActivation::Identity => Ok(xs.clone()),
            SupportedActivation::Sigmoid => candle_nn::ops::sigmoid(xs),
            SupportedActivation::Softmax => candle_nn::ops::softmax(xs, 1),
            SupportedActivation::Tanh => xs.tanh(),
            SupportedActivation::Relu => xs.relu(),
            SupportedActivation::LeakyRelu => candle_nn::ops::leaky_relu(xs, 0.01),
            SupportedActivation::Elu => xs.elu(1.0),
        }
    }
}

/// build a stack of alternating `M` and activation layers
pub struct StackLayers<M>
where
    M: ModuleT,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Nonlinearity>>,
}

impl<M> ModuleT for StackLayers<M>
where
    M: ModuleT,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward_t(&x, train)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: ModuleT,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Nonlinearity) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: ModuleT,
{
    fn default() -> Self {
        Self::new()
    }
}

pub fn same_padding_conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    vs: VarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: kernel / 2,
        ..Default::default()
    };
    candle_nn::conv2d(in_channels, out_channels, kernel, cfg, vs)
}

/// 3x3 stride-2 convolution halving the spatial size
pub fn downsampling_conv2d(
    in_channels: usize,
    out_channels: usize,
    vs: VarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride: 2,
        ..Default::default()
    };
    candle_nn::conv2d(in_channels, out_channels, 3, cfg, vs)
}

/// conv -> batchnorm -> dropout
pub struct ConvBnLayer {
    conv: Conv2d,
    bn: BatchNorm,
    dropout: Dropout,
}

impl ModuleT for ConvBnLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.conv.forward(xs)?;
        let h = self.bn.forward_t(&h, train)?;
        self.dropout.forward_t(&h, train)
    }
}

impl ConvBnLayer {
    pub fn new(channels: usize, dropout: f64, vs: VarBuilder) -> Result<Self> {
        let bn_config = candle_nn::BatchNormConfig {
            eps: 1e-4,
            remove_mean: true,
            affine: true,
            momentum: 0.1,
        };
        Ok(Self {
            conv: same_padding_conv2d(channels, channels, 3, vs.pp("conv"))?,
            bn: candle_nn::batch_norm(channels, bn_config, vs.pp("bn"))?,
            dropout: Dropout::new(dropout as f32),
        })
    }
}

/// x + f(x) with f = two conv-bn layers, then the nonlinearity
pub struct ResidualBlock {
    body: StackLayers<ConvBnLayer>,
    act: Nonlinearity,
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.body.forward_t(xs, train)?;
        self.act.forward(&(xs + h)?)
    }
}

impl ResidualBlock {
    pub fn new(
        channels: usize,
        act: SupportedActivation,
        dropout: f64,
        vs: VarBuilder,
    ) -> Result<Self> {
        let act = Nonlinearity(act);
        let mut body = StackLayers::new();
        body.push_with_act(ConvBnLayer::new(channels, dropout, vs.pp("0"))?, act);
        body.push(ConvBnLayer::new(channels, dropout, vs.pp("1"))?);
        Ok(Self { body, act })
    }
}
