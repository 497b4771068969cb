//! Encoding of constant table function inputs into fixed width cells.
//!
//! Every literal is handed to the kernel as a pointer to its own 8 byte cell
//! so the argument stride is the same as for column buffers. Only the value's
//! own bytes are written; the rest of the cell is whatever the allocation
//! started out as.

use tfexec_error::{DbError, Result};

use crate::allocation::AllocationContext;
use crate::arrays::scalar::ScalarValue;
use crate::buffer::aligned::SLOT_BYTES;
use crate::device::DeviceType;

/// A fixed width value that can be written into a literal cell.
pub trait LiteralValue: Copy {
    type Bytes: AsRef<[u8]>;

    /// Native endian bytes of the value.
    fn to_cell_bytes(self) -> Self::Bytes;
}

macro_rules! impl_literal_value {
    ($($t:ty),*) => {
        $(
            impl LiteralValue for $t {
                type Bytes = [u8; std::mem::size_of::<$t>()];

                fn to_cell_bytes(self) -> Self::Bytes {
                    self.to_ne_bytes()
                }
            }
        )*
    };
}

impl_literal_value!(i8, i16, i32, i64, f32, f64);

/// Create a literal cell for a typed value.
pub fn create_literal_buffer<T>(literal: T, ctx: &mut AllocationContext) -> Result<*const u8>
where
    T: LiteralValue,
{
    create_literal_buffer_from_bytes(literal.to_cell_bytes().as_ref(), ctx)
}

/// Create a literal cell from raw value bytes, placing it in host or device
/// memory depending on the context's device.
///
/// Errors if the value does not fit in a single cell. That can only happen
/// when a caller hands over the wrong bytes, so it's reported as an internal
/// error.
pub fn create_literal_buffer_from_bytes(
    bytes: &[u8],
    ctx: &mut AllocationContext,
) -> Result<*const u8> {
    if bytes.len() > SLOT_BYTES {
        return Err(
            DbError::internal("Literal value does not fit in a single cell")
                .with_field("value_bytes", bytes.len())
                .with_field("cell_bytes", SLOT_BYTES),
        );
    }

    match ctx.device_type() {
        DeviceType::Cpu => {
            let buf = ctx.alloc_host(SLOT_BYTES)?;
            buf.as_bytes_mut()[..bytes.len()].copy_from_slice(bytes);
            Ok(buf.as_ptr())
        }
        DeviceType::Gpu => {
            let ptr = ctx.alloc_device_with(SLOT_BYTES, bytes)?;
            Ok(ptr.as_ptr())
        }
    }
}

/// Encode a constant input.
///
/// Signed integers and floats are supported. Anything else is a
/// configuration error naming the value.
pub fn encode_scalar(value: &ScalarValue, ctx: &mut AllocationContext) -> Result<*const u8> {
    match value {
        ScalarValue::Int8(v) => create_literal_buffer(*v, ctx),
        ScalarValue::Int16(v) => create_literal_buffer(*v, ctx),
        ScalarValue::Int32(v) => create_literal_buffer(*v, ctx),
        ScalarValue::Int64(v) => create_literal_buffer(*v, ctx),
        ScalarValue::Float32(v) => create_literal_buffer(*v, ctx),
        ScalarValue::Float64(v) => create_literal_buffer(*v, ctx),
        other => Err(
            DbError::config(format!("Literal value {other} is not yet supported."))
                .with_field("datatype", other.datatype()),
        ),
    }
}
