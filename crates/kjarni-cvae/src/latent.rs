//! Prior and recognition networks over sentence embeddings, and the
//! reparameterised Gaussian sample drawn from them.

use anyhow::Result;
use ndarray::{concatenate, s, Array2, Axis};
use rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;

use crate::activations::Activation;
use crate::config::TransformerParams;
use crate::dropout::Dropout;
use crate::error::ModelError;
use crate::feedforward::FeedForwardNetwork;
use crate::traits::{Sublayer, SublayerArgs};
use crate::wrapper::{PrePostProcessingWrapper, WrapperPolicy};

/// `z = mu + exp(0.5 * logvar) * eps`, with fresh `eps ~ N(0, 1)` on every call.
pub fn sample_gaussian<R: Rng + ?Sized>(
    mu: &Array2<f32>,
    logvar: &Array2<f32>,
    rng: &mut R,
) -> Result<Array2<f32>> {
    if mu.dim() != logvar.dim() {
        anyhow::bail!(ModelError::shape("gaussian logvar", mu.shape(), logvar.shape()));
    }
    let eps: Array2<f32> = Array2::random_using(mu.dim(), StandardNormal, rng);
    Ok(mu + &(logvar.mapv(|v| (0.5 * v).exp()) * eps))
}

/// Result of the latent layer.
///
/// The recognition parameters are only present when a target embedding was
/// supplied.
#[derive(Debug, Clone)]
pub struct LatentOutput {
    pub latent_sample: Array2<f32>,
    pub prior_mu: Array2<f32>,
    pub prior_logvar: Array2<f32>,
    pub recog_mu: Option<Array2<f32>>,
    pub recog_logvar: Option<Array2<f32>>,
}

pub struct LatentVariableLayer {
    prior: PrePostProcessingWrapper<FeedForwardNetwork>,
    recognition: PrePostProcessingWrapper<FeedForwardNetwork>,
    latent_size: usize,
}

impl LatentVariableLayer {
    pub fn new(
        prior: FeedForwardNetwork,
        recognition: FeedForwardNetwork,
        latent_size: usize,
    ) -> Result<Self> {
        for (name, net) in [("prior", &prior), ("recognition", &recognition)] {
            if net.output_width() != 2 * latent_size {
                anyhow::bail!(ModelError::InvalidConfig(format!(
                    "{} network outputs {} values, expected 2 * latent_size = {}",
                    name,
                    net.output_width(),
                    2 * latent_size
                )));
            }
        }
        if recognition.input_width() != 2 * prior.input_width() {
            anyhow::bail!(ModelError::InvalidConfig(format!(
                "recognition network reads {} values, expected twice the prior input {}",
                recognition.input_width(),
                prior.input_width()
            )));
        }

        // Distribution parameters must not depend on dropout draws.
        let policy = WrapperPolicy::new(true, false, false);
        Ok(Self {
            prior: PrePostProcessingWrapper::new(prior, policy, 0.0)?,
            recognition: PrePostProcessingWrapper::new(recognition, policy, 0.0)?,
            latent_size,
        })
    }

    pub fn random<R: Rng + ?Sized>(params: &TransformerParams, rng: &mut R) -> Result<Self> {
        let hidden = params.hidden_size;
        let out = 2 * params.latent_size;
        let prior = FeedForwardNetwork::random(
            hidden,
            params.filter_size,
            out,
            Activation::Relu,
            0.0,
            false,
            params.initializer_gain,
            &mut *rng,
        )?;
        let recognition = FeedForwardNetwork::random(
            2 * hidden,
            params.filter_size,
            out,
            Activation::Relu,
            0.0,
            false,
            params.initializer_gain,
            &mut *rng,
        )?;
        Self::new(prior, recognition, params.latent_size)
    }

    pub fn latent_size(&self) -> usize {
        self.latent_size
    }

    pub fn num_parameters(&self) -> usize {
        self.prior.num_parameters() + self.recognition.num_parameters()
    }

    /// Runs one network over `[batch, width]` and splits the result into
    /// `(mu, logvar)`.
    fn distribution(
        &self,
        net: &PrePostProcessingWrapper<FeedForwardNetwork>,
        input: &Array2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let out = net
            .apply(
                &input.clone().insert_axis(Axis(1)),
                SublayerArgs::none(),
                &mut Dropout::disabled(),
            )?
            .remove_axis(Axis(1));
        let mu = out.slice(s![.., ..self.latent_size]).to_owned();
        let logvar = out.slice(s![.., self.latent_size..]).to_owned();
        Ok((mu, logvar))
    }

    /// Prior distribution from the source embedding `[batch, hidden]`.
    pub fn prior(&self, source_embedding: &Array2<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        self.distribution(&self.prior, source_embedding)
    }

    /// Posterior distribution from the source and target embeddings.
    pub fn recognition(
        &self,
        source_embedding: &Array2<f32>,
        target_embedding: &Array2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        if source_embedding.dim() != target_embedding.dim() {
            anyhow::bail!(ModelError::shape(
                "target sentence embedding",
                source_embedding.shape(),
                target_embedding.shape()
            ));
        }
        let joint = concatenate(Axis(1), &[source_embedding.view(), target_embedding.view()])?;
        self.distribution(&self.recognition, &joint)
    }

    /// Samples the latent variable.
    ///
    /// With a target embedding the sample comes from the recognition network,
    /// otherwise from the prior.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        source_embedding: &Array2<f32>,
        target_embedding: Option<&Array2<f32>>,
        rng: &mut R,
    ) -> Result<LatentOutput> {
        let (prior_mu, prior_logvar) = self.prior(source_embedding)?;

        match target_embedding {
            Some(target) => {
                let (recog_mu, recog_logvar) = self.recognition(source_embedding, target)?;
                let latent_sample = sample_gaussian(&recog_mu, &recog_logvar, rng)?;
                Ok(LatentOutput {
                    latent_sample,
                    prior_mu,
                    prior_logvar,
                    recog_mu: Some(recog_mu),
                    recog_logvar: Some(recog_logvar),
                })
            }
            None => {
                let latent_sample = sample_gaussian(&prior_mu, &prior_logvar, rng)?;
                Ok(LatentOutput {
                    latent_sample,
                    prior_mu,
                    prior_logvar,
                    recog_mu: None,
                    recog_logvar: None,
                })
            }
        }
    }
}
