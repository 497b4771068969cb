use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use tfexec_core::arrays::datatype::DataType;
use tfexec_core::buffer::buffer_manager::TrackedBufferManager;
use tfexec_core::config::TableFunctionExecConfig;
use tfexec_core::device::DeviceType;
use tfexec_core::exec::TableFunctionExecutionContext;
use tfexec_core::execution_unit::{
    FragmentInfo,
    InputTableInfo,
    OutputColumn,
    OutputRowSizing,
    TableFunctionExecutionUnit,
};
use tfexec_core::expr::InputExpr;
use tfexec_core::kernel::TableFunctionCompilationContext;
use tfexec_core::testutil::device::HostBackedDeviceAllocator;
use tfexec_core::testutil::fetch::MemoryColumnFetcher;
#[cfg(feature = "gpu")]
use tfexec_core::testutil::kernel::FnGpuKernel;
use tfexec_error::ErrorKind;

fn single_fragment(num_rows: usize) -> InputTableInfo {
    InputTableInfo {
        table_id: 1,
        fragments: vec![FragmentInfo {
            fragment_id: 0,
            num_rows,
        }],
    }
}

fn unit(
    name: &str,
    inputs: Vec<InputExpr>,
    outputs: usize,
    multiplier: f64,
) -> TableFunctionExecutionUnit {
    TableFunctionExecutionUnit {
        name: name.to_string(),
        input_exprs: inputs,
        output_exprs: (0..outputs)
            .map(|idx| OutputColumn::new(format!("out{idx}"), DataType::Int64))
            .collect(),
        output_row_sizing: Some(OutputRowSizing::RowMultiplier(multiplier)),
    }
}

static SCENARIO_A_LITERAL: AtomicI64 = AtomicI64::new(0);
static SCENARIO_A_ROWS: AtomicI64 = AtomicI64::new(0);
static SCENARIO_A_ALIGNED: AtomicUsize = AtomicUsize::new(0);

/// Adds the literal to each value of the int32 column.
unsafe extern "C" fn scenario_a_kernel(
    col_buffers: *const *const u8,
    input_row_count: *const i64,
    output_buffers: *const *mut u8,
    output_row_count: *mut i64,
) -> i32 {
    unsafe {
        let column = (*col_buffers).cast::<i32>();
        let literal_cell = *col_buffers.add(1);
        let literal = *literal_cell.cast::<i64>();
        let n = *input_row_count;

        SCENARIO_A_LITERAL.store(literal, Ordering::SeqCst);
        SCENARIO_A_ROWS.store(n, Ordering::SeqCst);
        if literal_cell as usize % 8 == 0 {
            SCENARIO_A_ALIGNED.fetch_add(1, Ordering::SeqCst);
        }

        let out = (*output_buffers).cast::<i64>();
        for idx in 0..n as usize {
            *out.add(idx) = *column.add(idx) as i64 + literal;
        }
        *output_row_count = n;
    }
    0
}

#[test]
fn column_and_literal_on_cpu() {
    logutil::init_test();

    let values: Vec<i32> = (0..100).collect();
    let fetcher = MemoryColumnFetcher::default().with_column(0, &values);
    let unit = unit(
        "add_literal",
        vec![
            InputExpr::column(1, 0, DataType::Int32),
            InputExpr::constant(7_i64),
        ],
        1,
        1.0,
    );
    let tracked = Arc::new(TrackedBufferManager::default());
    let compilation = TableFunctionCompilationContext::default().with_cpu(scenario_a_kernel);

    let result = TableFunctionExecutionContext::new(TableFunctionExecConfig::default(), tracked.clone())
        .execute(
            &unit,
            &single_fragment(100),
            Some(&compilation),
            &fetcher,
            DeviceType::Cpu,
        )
        .unwrap();

    assert_eq!(7, SCENARIO_A_LITERAL.load(Ordering::SeqCst));
    assert_eq!(100, SCENARIO_A_ROWS.load(Ordering::SeqCst));
    assert!(SCENARIO_A_ALIGNED.load(Ordering::SeqCst) > 0);

    assert_eq!(100, result.capacity());
    assert!(result.entry_count() <= 100);
    let expected: Vec<i64> = (7..107).collect();
    assert_eq!(expected, result.column_i64(0).unwrap());

    // Literal cell released, output storage kept.
    assert_eq!(100 * 8, tracked.bytes_in_use());
}

static SCENARIO_B_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counting_kernel(
    _col_buffers: *const *const u8,
    _input_row_count: *const i64,
    _output_buffers: *const *mut u8,
    output_row_count: *mut i64,
) -> i32 {
    SCENARIO_B_CALLS.fetch_add(1, Ordering::SeqCst);
    unsafe { *output_row_count = 0 };
    0
}

#[test]
fn mismatched_cardinality_fails_before_kernel() {
    logutil::init_test();

    let fetcher = MemoryColumnFetcher::default()
        .with_column(0, &[1_i64; 50])
        .with_column(1, &[1_i64; 51]);
    let unit = unit(
        "pairs",
        vec![
            InputExpr::column(1, 0, DataType::Int64),
            InputExpr::column(1, 1, DataType::Int64),
        ],
        1,
        1.0,
    );
    let tracked = Arc::new(TrackedBufferManager::default());
    let compilation = TableFunctionCompilationContext::default().with_cpu(counting_kernel);

    let err = TableFunctionExecutionContext::new(TableFunctionExecConfig::default(), tracked.clone())
        .execute(
            &unit,
            &single_fragment(51),
            Some(&compilation),
            &fetcher,
            DeviceType::Cpu,
        )
        .unwrap_err();

    assert_eq!(ErrorKind::Internal, err.kind());
    assert!(err.is_fatal());
    assert_eq!(0, SCENARIO_B_CALLS.load(Ordering::SeqCst));
    assert_eq!(0, tracked.bytes_in_use());
}

#[test]
fn unsupported_literal_fails_before_kernel() {
    logutil::init_test();

    let fetcher = MemoryColumnFetcher::default().with_column(0, &[1_i64; 4]);
    let unit = unit(
        "with_string",
        vec![
            InputExpr::column(1, 0, DataType::Int64),
            InputExpr::constant(2.0_f32),
            InputExpr::constant("hello"),
        ],
        1,
        1.0,
    );
    let tracked = Arc::new(TrackedBufferManager::default());
    let compilation = TableFunctionCompilationContext::default().with_cpu(counting_kernel);

    let err = TableFunctionExecutionContext::new(TableFunctionExecConfig::default(), tracked.clone())
        .execute(
            &unit,
            &single_fragment(4),
            Some(&compilation),
            &fetcher,
            DeviceType::Cpu,
        )
        .unwrap_err();

    assert_eq!(ErrorKind::Config, err.kind());
    assert!(!err.is_fatal());
    assert!(err.get_msg().contains("hello"), "{err}");
    assert_eq!(0, SCENARIO_B_CALLS.load(Ordering::SeqCst));
    assert_eq!(0, tracked.bytes_in_use());
}

/// Produces 15 rows regardless of input.
unsafe extern "C" fn fifteen_rows_kernel(
    _col_buffers: *const *const u8,
    _input_row_count: *const i64,
    output_buffers: *const *mut u8,
    output_row_count: *mut i64,
) -> i32 {
    unsafe {
        let out = (*output_buffers).cast::<i64>();
        for idx in 0..15 {
            *out.add(idx) = idx as i64;
        }
        *output_row_count = 15;
    }
    0
}

#[test]
fn row_multiplier_sizes_output() {
    logutil::init_test();

    let fetcher = MemoryColumnFetcher::default().with_column(0, &[0.5_f64; 10]);
    let unit = unit(
        "expand",
        vec![InputExpr::column(1, 0, DataType::Float64)],
        1,
        2.0,
    );
    let compilation = TableFunctionCompilationContext::default().with_cpu(fifteen_rows_kernel);

    let result = TableFunctionExecutionContext::new(
        TableFunctionExecConfig::default(),
        Arc::new(TrackedBufferManager::default()),
    )
    .execute(
        &unit,
        &single_fragment(10),
        Some(&compilation),
        &fetcher,
        DeviceType::Cpu,
    )
    .unwrap();

    assert_eq!(20, result.capacity());
    assert_eq!(15, result.entry_count());
    let expected: Vec<i64> = (0..15).collect();
    assert_eq!(expected, result.column_i64(0).unwrap());
}

#[test]
fn concurrent_invocations() {
    logutil::init_test();

    let fetcher = MemoryColumnFetcher::default().with_column(0, &[0.5_f64; 10]);
    let unit = unit(
        "expand",
        vec![InputExpr::column(1, 0, DataType::Float64)],
        1,
        2.0,
    );
    let compilation = TableFunctionCompilationContext::default().with_cpu(fifteen_rows_kernel);
    let tracked = Arc::new(TrackedBufferManager::default());
    let exec = TableFunctionExecutionContext::new(TableFunctionExecConfig::default(), tracked.clone());

    let (exec, unit, compilation, fetcher) = (&exec, &unit, &compilation, &fetcher);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(move |_| {
                s.spawn(move || {
                    exec.execute(
                        unit,
                        &single_fragment(10),
                        Some(compilation),
                        fetcher,
                        DeviceType::Cpu,
                    )
                    .map(|result| result.entry_count())
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(15, handle.join().unwrap().unwrap());
        }
    });

    assert_eq!(0, tracked.bytes_in_use());
    assert_eq!(4, fetcher.fetch_count());
}

/// Fills every output slot with the input row count, never setting the
/// output row count.
#[cfg(feature = "gpu")]
unsafe extern "C" fn fill_kernel(
    _error_buffer: *mut i32,
    _col_buffers: *const *const u8,
    input_row_count: *const i64,
    output_buffers: *const *mut u8,
    _output_row_count: *mut i64,
) {
    unsafe {
        let n = *input_row_count;
        let out = (*output_buffers).cast::<i64>();
        // Capacity is 1.5x the input.
        for idx in 0..(n as usize * 3).div_ceil(2) {
            *out.add(idx) = n;
        }
    }
}

struct GpuFixture {
    device: Arc<HostBackedDeviceAllocator>,
    tracked: Arc<TrackedBufferManager>,
    fetcher: MemoryColumnFetcher,
    unit: TableFunctionExecutionUnit,
}

impl GpuFixture {
    fn new(device: HostBackedDeviceAllocator) -> Self {
        let device = Arc::new(device);
        GpuFixture {
            device: device.clone(),
            tracked: Arc::new(TrackedBufferManager::default()),
            fetcher: MemoryColumnFetcher::default()
                .with_device(device)
                .with_column(0, &[3_i32; 10]),
            unit: unit(
                "fill",
                vec![
                    InputExpr::column(1, 0, DataType::Int32),
                    InputExpr::constant(1.25_f64),
                ],
                1,
                1.5,
            ),
        }
    }

    #[cfg(feature = "gpu")]
    fn execute(&self, kernel: FnGpuKernel) -> tfexec_error::Result<tfexec_core::result::ResultSet> {
        let compilation = TableFunctionCompilationContext::default().with_gpu(Arc::new(kernel));
        TableFunctionExecutionContext::new(TableFunctionExecConfig::default(), self.tracked.clone())
            .with_device_allocator(self.device.clone())
            .execute(
                &self.unit,
                &single_fragment(10),
                Some(&compilation),
                &self.fetcher,
                DeviceType::Gpu,
            )
    }
}

#[test]
#[cfg(feature = "gpu")]
fn gpu_unset_row_count_uses_capacity() {
    logutil::init_test();

    let fixture = GpuFixture::new(HostBackedDeviceAllocator::new(0));
    let result = fixture
        .execute(FnGpuKernel::new("fill", fill_kernel))
        .unwrap();

    assert_eq!(15, result.capacity());
    assert_eq!(result.capacity(), result.entry_count());
    assert_eq!(vec![10; 15], result.column_i64(0).unwrap());
    assert_eq!(0, fixture.device.live_allocations());
}

#[test]
#[cfg(feature = "gpu")]
fn gpu_launch_failure_releases_device_memory() {
    logutil::init_test();

    let fixture = GpuFixture::new(HostBackedDeviceAllocator::new(0));
    let err = fixture
        .execute(FnGpuKernel::new("fill", fill_kernel).with_launch_failure())
        .unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(0, fixture.device.live_allocations());
    assert_eq!(0, fixture.tracked.bytes_in_use());
}

#[test]
#[cfg(feature = "gpu")]
fn gpu_out_of_memory_releases_device_memory() {
    logutil::init_test();

    // Enough for the column, literal and staged inputs, but not the output
    // mirror.
    let fixture = GpuFixture::new(HostBackedDeviceAllocator::new(0).with_max_allocations(6));
    let err = fixture
        .execute(FnGpuKernel::new("fill", fill_kernel))
        .unwrap_err();

    assert!(err.get_msg().contains("Out of device memory"), "{err}");
    assert_eq!(0, fixture.device.live_allocations());
    assert_eq!(0, fixture.tracked.bytes_in_use());
}

#[test]
#[cfg(not(feature = "gpu"))]
fn gpu_request_without_gpu_support() {
    logutil::init_test();

    let fixture = GpuFixture::new(HostBackedDeviceAllocator::new(0));
    let err = TableFunctionExecutionContext::new(
        TableFunctionExecConfig::default(),
        fixture.tracked.clone(),
    )
    .with_device_allocator(fixture.device.clone())
    .execute(
        &fixture.unit,
        &single_fragment(10),
        Some(&TableFunctionCompilationContext::default()),
        &fixture.fetcher,
        DeviceType::Gpu,
    )
    .unwrap_err();

    assert_eq!(ErrorKind::Internal, err.kind());
    assert_eq!("GPU execution support is not compiled in", err.get_msg());
    assert_eq!(0, fixture.fetcher.fetch_count());
    assert_eq!(0, fixture.device.live_allocations());
    assert_eq!(0, fixture.tracked.bytes_in_use());
}
