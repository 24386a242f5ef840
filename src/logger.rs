//! The process-wide logger: site registry, producer staging rings, the
//! consumer thread and its async write pipeline.
//!
//! Producers never format anything. A log call packs a dynamic record
//! into the calling thread's staging ring and returns; the single
//! consumer thread polls every ring, rebuilds the textual lines into one
//! half of a double buffer and hands full halves to io_uring, keeping at
//! most one write in flight.

use std::ffi::CString;
use std::io;
use std::mem;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use io_uring::{opcode, types, IoUring};
use lazy_static::lazy_static;

use crate::arguments::{LogArgs, MAX_LOG_ARGS};
use crate::clock;
use crate::config;
use crate::error::SetLogFileError;
use crate::log_assembler::LogAssembler;
use crate::log_site::{
    read_dynamic_header, write_dynamic_header, DynamicHeader, Level, LogSite, SiteRecord,
    DYNAMIC_HEADER_SIZE, UNREGISTERED_LOG_ID,
};
use crate::staging_buffer::{DestructGuard, StagingBuffer};

lazy_static! {
    static ref LOGGER: Logger = Logger::new();
}

thread_local! {
    static PRODUCER_RING: std::cell::RefCell<Option<ProducerSlot>> =
        const { std::cell::RefCell::new(None) };
}

/// A producer thread's handle to its ring. Dropping the slot (at thread
/// exit) drops the guard, which marks the ring for reclamation once the
/// consumer has drained it.
struct ProducerSlot {
    staging_buffer: Arc<StagingBuffer>,
    _destruct_guard: DestructGuard,
}

struct ProducerBufferTable {
    buffers: Vec<Arc<StagingBuffer>>,
    next_buffer_id: u32,
}

struct Inner {
    current_log_level: AtomicU8,
    output_fd: AtomicI32,
    registered_info: Mutex<Vec<SiteRecord>>,
    producer_buffers: Mutex<ProducerBufferTable>,
    consumer_should_exit: AtomicBool,
}

pub struct Logger {
    inner: Arc<Inner>,
    consumer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Logger {
    /// The process-wide instance. First use starts the consumer thread
    /// and registers the exit hook that flushes and joins it.
    pub fn instance() -> &'static Logger {
        &LOGGER
    }

    fn new() -> Logger {
        let inner = Arc::new(Inner {
            current_log_level: AtomicU8::new(config::DEFAULT_LOG_LEVEL as u8),
            output_fd: AtomicI32::new(libc::STDOUT_FILENO),
            registered_info: Mutex::new(Vec::new()),
            producer_buffers: Mutex::new(ProducerBufferTable {
                buffers: Vec::new(),
                next_buffer_id: 0,
            }),
            consumer_should_exit: AtomicBool::new(false),
        });

        let ring_io = match IoUring::new(config::IO_URING_ENTRIES) {
            Ok(ring_io) => ring_io,
            Err(err) => {
                eprintln!("deferlog: can't init io_uring queue: {err}");
                process::exit(1);
            }
        };

        let consumer_inner = Arc::clone(&inner);
        let consumer_thread = match thread::Builder::new()
            .name("deferlog-consumer".into())
            .spawn(move || consumer_thread_main(consumer_inner, ring_io))
        {
            Ok(handle) => handle,
            Err(err) => {
                eprintln!("deferlog: can't start the consumer thread: {err}");
                process::exit(1);
            }
        };

        // lazy_static never drops its value, so shutdown is pinned to
        // process exit instead.
        unsafe {
            libc::atexit(shutdown_at_exit);
        }

        Logger {
            inner,
            consumer_thread: Mutex::new(Some(consumer_thread)),
        }
    }

    /// Highest level that is currently emitted.
    pub fn log_level() -> Level {
        level_from_u8(
            Logger::instance()
                .inner
                .current_log_level
                .load(Ordering::Relaxed),
        )
    }

    pub fn set_log_level(level: Level) {
        Logger::instance()
            .inner
            .current_log_level
            .store(level as u8, Ordering::Relaxed);
    }

    /// Opens (or creates) `path` as the sink and replaces the previous
    /// file descriptor. On failure the previous sink stays in place.
    pub fn set_log_file(path: &str) -> Result<(), SetLogFileError> {
        let logger = Logger::instance();
        let c_path = CString::new(path)
            .map_err(|_| SetLogFileError::InvalidPath(path.to_string()))?;

        unsafe {
            if libc::access(c_path.as_ptr(), libc::F_OK) == 0
                && libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) != 0
            {
                return Err(SetLogFileError::NotAccessible(path.to_string()));
            }

            let new_fd = libc::open(
                c_path.as_ptr(),
                config::LOG_FILE_FLAGS,
                config::LOG_FILE_MODE as libc::c_uint,
            );
            if new_fd < 0 {
                return Err(SetLogFileError::Open(
                    path.to_string(),
                    io::Error::last_os_error(),
                ));
            }

            let old_fd = logger.inner.output_fd.swap(new_fd, Ordering::AcqRel);
            if old_fd > 0 && old_fd != libc::STDOUT_FILENO {
                libc::close(old_fd);
            }
        }
        Ok(())
    }

    fn register_log_info(
        &self,
        site: &'static LogSite,
        site_id: &AtomicI32,
        level: Level,
        param_sizes: Vec<usize>,
    ) -> i32 {
        let mut registered = self.inner.registered_info.lock().unwrap();

        // Another thread may have won the race for this site.
        let current = site_id.load(Ordering::Relaxed);
        if current != UNREGISTERED_LOG_ID {
            return current;
        }

        let log_id = registered.len() as i32;
        registered.push(SiteRecord {
            site,
            level,
            param_sizes: Arc::from(param_sizes.into_boxed_slice()),
        });
        site_id.store(log_id, Ordering::Release);
        log_id
    }

    fn with_producer_ring<R>(&self, body: impl FnOnce(&StagingBuffer) -> R) -> R {
        PRODUCER_RING.with(|slot| {
            let mut slot = slot.borrow_mut();
            let slot = slot.get_or_insert_with(|| self.allocate_producer_ring());
            body(&slot.staging_buffer)
        })
    }

    fn allocate_producer_ring(&self) -> ProducerSlot {
        let mut table = self.inner.producer_buffers.lock().unwrap();
        let buffer_id = table.next_buffer_id;
        table.next_buffer_id += 1;
        drop(table);

        // The allocation itself needs no lock.
        let staging_buffer = Arc::new(StagingBuffer::new(
            buffer_id,
            config::STAGING_BUFFER_SIZE,
        ));
        let mut destruct_guard = DestructGuard::new();
        destruct_guard.bind(Arc::clone(&staging_buffer));

        let mut table = self.inner.producer_buffers.lock().unwrap();
        table.buffers.push(Arc::clone(&staging_buffer));
        drop(table);

        ProducerSlot {
            staging_buffer,
            _destruct_guard: destruct_guard,
        }
    }

    fn shutdown(&self) {
        self.inner
            .consumer_should_exit
            .store(true, Ordering::Release);
        let handle = self.consumer_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let fd = self
            .inner
            .output_fd
            .swap(libc::STDOUT_FILENO, Ordering::AcqRel);
        if fd > 0 && fd != libc::STDOUT_FILENO {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

extern "C" fn shutdown_at_exit() {
    Logger::instance().shutdown();
}

fn level_from_u8(value: u8) -> Level {
    match value {
        0 => Level::None,
        1 => Level::Error,
        2 => Level::Warning,
        3 => Level::Info,
        // Values past the chattiest level clamp to it.
        _ => Level::Debug,
    }
}

/// Packs one record into the calling thread's ring. Called by the `log!`
/// macro after its level gate; not part of the public surface.
#[doc(hidden)]
pub fn log_record<A: LogArgs>(
    site: &'static LogSite,
    site_id: &'static AtomicI32,
    level: Level,
    args: A,
) {
    let logger = Logger::instance();

    let mut log_id = site_id.load(Ordering::Acquire);
    if log_id == UNREGISTERED_LOG_ID {
        let mut param_sizes = vec![0usize; site.param_types.len()];
        args.fill_static_sizes(site.param_types, &mut param_sizes);
        log_id = logger.register_log_info(site, site_id, level, param_sizes);
    }

    let num_params = site.param_types.len();
    let mut string_sizes = [0usize; MAX_LOG_ARGS];
    let mut pre_precision = 0usize;
    let ms_timestamp = clock::unix_millis();
    let arg_bytes = args.packed_size(
        site.param_types,
        &mut string_sizes[..num_params],
        &mut pre_precision,
    );
    let info_size = DYNAMIC_HEADER_SIZE + arg_bytes;

    logger.with_producer_ring(|ring| {
        let region = ring.reserve_producer_space(info_size);
        write_dynamic_header(
            region,
            DynamicHeader {
                log_id: log_id as usize,
                info_size,
                ms_timestamp,
            },
        );
        let stored = args.store_all(
            &mut region[DYNAMIC_HEADER_SIZE..],
            site.param_types,
            &string_sizes[..num_params],
        );
        debug_assert_eq!(DYNAMIC_HEADER_SIZE + stored, info_size);
        ring.finish_reservation(info_size);
    });
}

fn consumer_thread_main(inner: Arc<Inner>, mut ring_io: IoUring) {
    let mut assembler = LogAssembler::new();
    let mut buffer_for_log = vec![0u8; config::DOUBLE_BUFFER_SIZE].into_boxed_slice();
    let mut buffer_for_io = vec![0u8; config::DOUBLE_BUFFER_SIZE].into_boxed_slice();
    let mut shadow_registered_info: Vec<SiteRecord> = Vec::new();
    let mut outstanding_writes: u32 = 0;
    assembler.set_buffer(config::DOUBLE_BUFFER_SIZE);

    loop {
        // Poll every producer ring. The table lock is released while a
        // ring's records are being drained so producers can register new
        // rings; the consumer is the only one that ever removes entries,
        // so indices stay valid across the gap.
        let mut table = inner.producer_buffers.lock().unwrap();
        let mut index = 0;
        while index < table.buffers.len() {
            let consuming_buffer = Arc::clone(&table.buffers[index]);
            let peeked = consuming_buffer.peek();
            if !peeked.is_empty() {
                drop(table);

                let mut bytes_consumed = 0;
                while bytes_consumed < peeked.len() {
                    let header = read_dynamic_header(&peeked[bytes_consumed..]);
                    if header.log_id >= shadow_registered_info.len() {
                        update_shadow_registered_info(&inner, &mut shadow_registered_info);
                    }
                    let record = &shadow_registered_info[header.log_id];
                    let arg_data = &peeked
                        [bytes_consumed + DYNAMIC_HEADER_SIZE..bytes_consumed + header.info_size];
                    assembler.load_log_info(
                        record,
                        header.ms_timestamp,
                        arg_data,
                        consuming_buffer.id(),
                    );

                    while assembler.has_remaining_data() {
                        assembler.write(&mut buffer_for_log);
                        if assembler.is_buffer_full() {
                            let nbytes = assembler.written_bytes();
                            swap_double_buffer(
                                &inner,
                                &mut ring_io,
                                &mut buffer_for_log,
                                &mut buffer_for_io,
                                nbytes,
                                &mut outstanding_writes,
                            );
                            assembler.set_buffer(config::DOUBLE_BUFFER_SIZE);
                        }
                    }

                    bytes_consumed += header.info_size;
                    consuming_buffer.consume(header.info_size);
                }

                table = inner.producer_buffers.lock().unwrap();
                index += 1;
            } else if consuming_buffer.should_be_destructed() {
                // Producer exited and the ring is drained; reclaim it and
                // keep the iteration index pointing at the next entry.
                table.buffers.remove(index);
            } else {
                index += 1;
            }
        }
        drop(table);

        let bytes_in_buffer = assembler.written_bytes();
        if bytes_in_buffer > 0 {
            swap_double_buffer(
                &inner,
                &mut ring_io,
                &mut buffer_for_log,
                &mut buffer_for_io,
                bytes_in_buffer,
                &mut outstanding_writes,
            );
            assembler.set_buffer(config::DOUBLE_BUFFER_SIZE);
        } else if inner.consumer_should_exit.load(Ordering::Acquire) {
            // A full pass found nothing to write; once the last async
            // write is reaped there is nothing left in flight.
            if outstanding_writes > 0 {
                wait_for_io_uring(&mut ring_io, &mut outstanding_writes);
            }
            break;
        } else {
            thread::yield_now();
        }
    }
}

fn update_shadow_registered_info(inner: &Inner, shadow: &mut Vec<SiteRecord>) {
    let registered = inner.registered_info.lock().unwrap();
    for record in registered.iter().skip(shadow.len()) {
        shadow.push(record.clone());
    }
}

/// Exchanges the formatting and I/O halves and submits the filled one.
/// Waits first if a write is still in flight, keeping the invariant of at
/// most one outstanding operation.
fn swap_double_buffer(
    inner: &Inner,
    ring_io: &mut IoUring,
    buffer_for_log: &mut Box<[u8]>,
    buffer_for_io: &mut Box<[u8]>,
    nbytes: usize,
    outstanding_writes: &mut u32,
) {
    if *outstanding_writes > 0 {
        wait_for_io_uring(ring_io, outstanding_writes);
    }
    mem::swap(buffer_for_log, buffer_for_io);
    if nbytes == 0 {
        return;
    }
    submit_log(inner, ring_io, buffer_for_io, nbytes, outstanding_writes);
}

fn wait_for_io_uring(ring_io: &mut IoUring, outstanding_writes: &mut u32) {
    match ring_io.submit_and_wait(1) {
        Ok(_) => {
            *outstanding_writes -= 1;
            if let Some(entry) = ring_io.completion().next() {
                if entry.result() < 0 {
                    eprintln!(
                        "deferlog: an error occurred while waiting for a log write, \
                         your log message may be incomplete: {}",
                        io::Error::from_raw_os_error(-entry.result())
                    );
                }
            }
        }
        Err(err) => {
            *outstanding_writes = 0;
            eprintln!(
                "deferlog: an error occurred while waiting for a log write, \
                 your log message may be incomplete: {err}"
            );
        }
    }
}

fn submit_log(
    inner: &Inner,
    ring_io: &mut IoUring,
    buffer_for_io: &[u8],
    nbytes: usize,
    outstanding_writes: &mut u32,
) {
    let fd = inner.output_fd.load(Ordering::Acquire);
    // Offset -1: write at the file's current position, which append-mode
    // files and stdout both honor.
    let entry = opcode::Write::new(types::Fd(fd), buffer_for_io.as_ptr(), nbytes as u32)
        .offset(u64::MAX)
        .build();

    if unsafe { ring_io.submission().push(&entry) }.is_err() {
        eprintln!("deferlog: submission queue is full, {nbytes} bytes of log data were dropped");
        return;
    }
    match ring_io.submit() {
        Ok(_) => *outstanding_writes += 1,
        Err(err) => eprintln!(
            "deferlog: an error occurred while submitting a log write, \
             your log message may be incomplete: {err}"
        ),
    }
}
