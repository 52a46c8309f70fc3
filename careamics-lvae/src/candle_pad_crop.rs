use crate::error::{invalid_arg, LvaeResult};
use candle_core::Tensor;

/// Spatial dimensions of a (B, C, [Z], Y, X) tensor
fn spatial_dims(x: &Tensor, size: &[usize]) -> LvaeResult<Vec<usize>> {
    let dims = x.dims();
    match (dims.len(), size.len()) {
        (4, 2) | (5, 3) => Ok(dims[2..].to_vec()),
        (r, n) => invalid_arg!(
            "expected a (B, C, Y, X) tensor with 2 target sizes or (B, C, Z, Y, X) with 3, \
             got rank {} and {} sizes",
            r,
            n
        ),
    }
}

/// Zero-pad every spatial dimension of `x` to `size`; an odd difference
/// puts the extra element after the data.
pub fn pad_img_tensor(x: &Tensor, size: &[usize]) -> LvaeResult<Tensor> {
    let current = spatial_dims(x, size)?;

    let mut ret = x.clone();
    for (d, (&have, &want)) in current.iter().zip(size.iter()).enumerate() {
        if want < have {
            invalid_arg!(
                "pad target {:?} is smaller than the current size {:?}",
                size,
                current
            );
        }
        let diff = want - have;
        if diff > 0 {
            let before = diff / 2;
            ret = ret.pad_with_zeros(d + 2, before, diff - before)?;
        }
    }
    Ok(ret)
}

/// Center-crop every spatial dimension of `x` to `size`, the inverse of
/// [`pad_img_tensor`].
pub fn crop_img_tensor(x: &Tensor, size: &[usize]) -> LvaeResult<Tensor> {
    let current = spatial_dims(x, size)?;

    let mut ret = x.clone();
    for (d, (&have, &want)) in current.iter().zip(size.iter()).enumerate() {
        if want > have {
            invalid_arg!(
                "crop target {:?} is larger than the current size {:?}",
                size,
                current
            );
        }
        let diff = have - want;
        if diff > 0 {
            ret = ret.narrow(d + 2, diff / 2, want)?;
        }
    }
    Ok(ret)
}
