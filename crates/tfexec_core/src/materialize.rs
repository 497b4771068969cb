use tfexec_error::{DbError, Result};
use tracing::trace;

use crate::allocation::AllocationContext;
use crate::device::DeviceId;
use crate::execution_unit::{FragmentInfo, TableFunctionExecutionUnit};
use crate::expr::InputExpr;
use crate::fetch::ColumnFetcher;
use crate::literal::encode_scalar;

/// Kernel-ready inputs for one invocation.
#[derive(Debug)]
pub struct MaterializedInputs {
    /// One buffer per input expression, in declaration order.
    pub col_buf_ptrs: Vec<*const u8>,
    /// Row count shared by every column input.
    ///
    /// None if no input was a column.
    pub input_row_count: Option<usize>,
}

/// Resolve every input expression to a buffer on the context's device.
///
/// Column buffers are fetched at the memory level matching the context and
/// held by the context for its lifetime. Literals are encoded into cells owned
/// by the context. All columns must have the same number of rows.
pub fn materialize_inputs(
    unit: &TableFunctionExecutionUnit,
    fragment: &FragmentInfo,
    fetcher: &dyn ColumnFetcher,
    device_id: DeviceId,
    ctx: &mut AllocationContext,
) -> Result<MaterializedInputs> {
    let mut col_buf_ptrs = Vec::with_capacity(unit.input_exprs.len());
    let mut input_row_count: Option<usize> = None;

    for (idx, input) in unit.input_exprs.iter().enumerate() {
        match input {
            InputExpr::Column(column) => {
                let fetched =
                    fetcher.fetch_one_fragment(column, fragment, ctx.memory_level(), device_id)?;

                match input_row_count {
                    None => input_row_count = Some(fetched.num_elements),
                    Some(expected) if expected != fetched.num_elements => {
                        return Err(DbError::internal(
                            "Table function column inputs have mismatched row counts",
                        )
                        .with_field("function", &unit.name)
                        .with_field("input_idx", idx)
                        .with_field("expected", expected)
                        .with_field("got", fetched.num_elements));
                    }
                    Some(_) => (),
                }

                trace!(idx, %column, num_elements = fetched.num_elements, "fetched column input");
                col_buf_ptrs.push(ctx.borrow_column(fetched));
            }
            InputExpr::Constant(value) => {
                trace!(idx, %value, "encoding literal input");
                col_buf_ptrs.push(encode_scalar(value, ctx)?);
            }
            InputExpr::Unresolved(desc) => {
                return Err(DbError::config(format!(
                    "Unsupported table function input expression: {desc}"
                ))
                .with_field("function", &unit.name)
                .with_field("input_idx", idx));
            }
        }
    }

    if col_buf_ptrs.len() != unit.input_exprs.len() {
        return Err(DbError::internal("Not every table function input was materialized")
            .with_field("materialized", col_buf_ptrs.len())
            .with_field("inputs", unit.input_exprs.len()));
    }

    Ok(MaterializedInputs {
        col_buf_ptrs,
        input_row_count,
    })
}
