use candle_core::{Device, Tensor};
use rand::prelude::SliceRandom;

pub struct MinibatchData {
    pub input: Tensor,
    pub target: Tensor,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_samples(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// In-memory image patches. Inputs are (N x C_in x Y x X), targets
/// (N x C_out x Y x X); patch `i` of both goes into the same minibatch.
///
pub struct PatchData {
    input_data: Tensor,
    target_data: Tensor,
    minibatches: Minibatches,
}

impl PatchData {
    pub fn new(input: Tensor, target: Tensor) -> anyhow::Result<Self> {
        if input.rank() != 4 || target.rank() != 4 {
            anyhow::bail!(
                "expected (N, C, Y, X) inputs and targets, got {:?} and {:?}",
                input.dims(),
                target.dims()
            );
        }
        let n = input.dim(0)?;
        if n != target.dim(0)? || input.dims()[2..] != target.dims()[2..] {
            anyhow::bail!(
                "inputs {:?} and targets {:?} do not pair up",
                input.dims(),
                target.dims()
            );
        }
        if n == 0 {
            anyhow::bail!("no patches");
        }

        Ok(PatchData {
            input_data: input,
            target_data: target,
            minibatches: Minibatches {
                samples: (0..n).collect(),
                chunks: vec![],
            },
        })
    }

    pub fn input_shape(&self) -> &[usize] {
        self.input_data.dims()
    }
}

impl DataLoader for PatchData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let Some(chunk) = self.minibatches.chunks.get(batch_idx) else {
            anyhow::bail!(
                "need to shuffle data (batch {} of {})",
                batch_idx,
                self.minibatches.chunks.len()
            );
        };

        let idx: Vec<u32> = chunk.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, chunk.len(), self.input_data.device())?;

        Ok(MinibatchData {
            input: self
                .input_data
                .index_select(&idx, 0)?
                .to_device(target_device)?,
            target: self
                .target_data
                .index_select(&idx, 0)?
                .to_device(target_device)?,
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_samples(&self) -> usize {
        self.minibatches.size()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }
        self.minibatches.shuffle_minibatch(batch_size);
        Ok(())
    }
}

pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    /// Random permutation split into consecutive chunks; the last one may
    /// be short
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);
        self.chunks = self
            .samples
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}
