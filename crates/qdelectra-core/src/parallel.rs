use candle_core::Device;
use candle_nn::VarMap;
use tracing::trace;

use crate::device::device_name;
use crate::error::CoreResult;
use crate::model::{Batch, DistillModel, DistillOutputs};

/// Splits each batch into one contiguous chunk per replica device, runs the
/// wrapped model on every chunk and gathers the results on the model's own
/// device.
///
/// Chunks bound for another device are moved there with their parameters;
/// `to_device` is differentiable, so one backward pass over the gathered loss
/// accumulates every replica's gradients into the wrapped model's variables.
///
/// Task losses come back as one entry per replica (`[replicas]`); the loss
/// engine averages them.  Logits, hidden states and attentions are
/// concatenated back along the batch axis in chunk order.
pub struct DataParallel<'a, M: ?Sized> {
    inner: &'a M,
    devices: Vec<Device>,
}

impl<'a, M: DistillModel + ?Sized> DataParallel<'a, M> {
    /// An empty `devices` list means the model's own device only.
    pub fn new(inner: &'a M, devices: Vec<Device>) -> Self {
        let devices = if devices.is_empty() { vec![inner.device().clone()] } else { devices };
        Self { inner, devices }
    }

    pub fn replicas(&self) -> usize {
        self.devices.len()
    }
}

impl<M: DistillModel + ?Sized> DistillModel for DataParallel<'_, M> {
    fn forward(&self, batch: &Batch, train: bool) -> CoreResult<DistillOutputs> {
        let primary = self.inner.device();
        let size = batch.size()?;
        let chunk = size.div_ceil(self.devices.len()).max(1);

        let mut parts = Vec::with_capacity(self.devices.len());
        let mut start = 0;
        for device in &self.devices {
            if start >= size {
                break;
            }
            let len = chunk.min(size - start);
            let part = batch.narrow(start, len)?;
            let out = if device.same_device(primary) {
                self.inner.forward(&part, train)?
            } else {
                trace!(device = device_name(device), start, len, "Scattering chunk");
                self.inner
                    .forward_replica(device, &part.to_device(device)?, train)?
                    .to_device(primary)?
            };
            parts.push(out);
            start += len;
        }
        DistillOutputs::gather(&parts)
    }

    fn forward_replica(&self, device: &Device, batch: &Batch, train: bool) -> CoreResult<DistillOutputs> {
        self.inner.forward_replica(device, batch, train)
    }

    fn varmap(&self) -> &VarMap {
        self.inner.varmap()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }
}
