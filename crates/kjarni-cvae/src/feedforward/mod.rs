//! Position-wise feed-forward network with optional padding removal.

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rand::Rng;

use crate::activations::{apply_activation, Activation};
use crate::dropout::Dropout;
use crate::error::ModelError;
use crate::linear_layer::LinearLayer;
use crate::traits::{Sublayer, SublayerArgs};


/// `output(dropout(act(filter(x))))`
pub struct FeedForwardNetwork {
    filter: LinearLayer,
    output: LinearLayer,
    activation: Activation,
    relu_dropout: f32,
    allow_pad: bool,
}

impl FeedForwardNetwork {
    pub fn new(
        filter: LinearLayer,
        output: LinearLayer,
        activation: Activation,
        relu_dropout: f32,
        allow_pad: bool,
    ) -> Result<Self> {
        if filter.out_features() != output.in_features() {
            anyhow::bail!(ModelError::InvalidConfig(format!(
                "filter width {} does not feed output layer expecting {}",
                filter.out_features(),
                output.in_features()
            )));
        }
        Ok(Self {
            filter,
            output,
            activation,
            relu_dropout,
            allow_pad,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn random<R: Rng + ?Sized>(
        input_size: usize,
        filter_size: usize,
        output_size: usize,
        activation: Activation,
        relu_dropout: f32,
        allow_pad: bool,
        gain: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let filter = LinearLayer::random(input_size, filter_size, true, gain, &mut *rng);
        let output = LinearLayer::random(filter_size, output_size, true, gain, &mut *rng);
        Self::new(filter, output, activation, relu_dropout, allow_pad)
    }

    pub fn num_parameters(&self) -> usize {
        self.filter.num_parameters() + self.output.num_parameters()
    }

    fn transform_rows(&self, rows: &ArrayView2<f32>, dropout: &mut Dropout) -> Array2<f32> {
        let mut hidden = self.filter.matmul(rows);
        apply_activation(&mut hidden, self.activation);
        let hidden = dropout.apply(hidden, self.relu_dropout);
        self.output.matmul(&hidden.view())
    }

    /// Runs the network over `[batch, len, in]`.
    ///
    /// With `padding` (1.0 marks a padding position) and padding removal
    /// allowed, padded rows skip the computation and come back as zeros.
    /// Non-padded rows are identical either way.
    pub fn forward(
        &self,
        x: &Array3<f32>,
        padding: Option<&Array2<f32>>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        let (batch, len, width) = x.dim();
        if width != self.filter.in_features() {
            anyhow::bail!(ModelError::shape(
                "FeedForwardNetwork input",
                &[batch, len, self.filter.in_features()],
                x.shape()
            ));
        }

        let x_std = x.as_standard_layout();
        let rows = x_std.view().into_shape_with_order((batch * len, width))?;
        let out_width = self.output.out_features();

        let out_rows = match padding.filter(|_| self.allow_pad) {
            Some(pad) => {
                if pad.dim() != (batch, len) {
                    anyhow::bail!(ModelError::shape("padding mask", &[batch, len], pad.shape()));
                }
                let keep: Vec<usize> = pad
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| **p < 1e-9)
                    .map(|(i, _)| i)
                    .collect();

                let mut scattered = Array2::<f32>::zeros((batch * len, out_width));
                if !keep.is_empty() {
                    let gathered = rows.select(Axis(0), &keep);
                    let computed = self.transform_rows(&gathered.view(), dropout);
                    for (src, &dst) in keep.iter().enumerate() {
                        scattered.row_mut(dst).assign(&computed.row(src));
                    }
                }
                scattered
            }
            None => self.transform_rows(&rows, dropout),
        };

        Ok(out_rows.into_shape_with_order((batch, len, out_width))?)
    }
}

impl Sublayer for FeedForwardNetwork {
    fn input_width(&self) -> usize {
        self.filter.in_features()
    }

    fn output_width(&self) -> usize {
        self.output.out_features()
    }

    fn num_parameters(&self) -> usize {
        FeedForwardNetwork::num_parameters(self)
    }

    fn apply(
        &self,
        input: &Array3<f32>,
        args: SublayerArgs<'_>,
        dropout: &mut Dropout,
    ) -> Result<Array3<f32>> {
        self.forward(input, args.padding, dropout)
    }
}
