//! Receive queue shared between the UART receive interrupt and the command
//! loop.
//!
//! The queue is single producer / single consumer: only the interrupt side
//! advances the head and only the command loop advances the tail, so no lock
//! is required. When the queue is full the newest byte is dropped; unread
//! data is never overwritten and the producer never blocks. Losing bytes
//! under overrun is expected behaviour, the line protocol recovers on the
//! next line feed.

use core::marker::PhantomData;

use embedded_hal::serial::{Read, Write};
use heapless::spsc::{Consumer, Producer, Queue};

use crate::SerialPort;

/// Queue storage. Holds up to `N - 1` bytes.
pub struct RxQueue<const N: usize> {
    queue: Queue<u8, N>,
}

/// Outcome of handing a byte to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Stored,
    Dropped,
}

impl<const N: usize> RxQueue<N> {
    pub const fn new() -> Self {
        Self { queue: Queue::new() }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Split into the interrupt and command loop halves.
    pub fn split(&mut self) -> (RxProducer<'_, N>, RxConsumer<'_, N>) {
        let (producer, consumer) = self.queue.split();
        (RxProducer { producer }, RxConsumer { consumer })
    }
}

impl<const N: usize> Default for RxQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RxProducer<'a, const N: usize> {
    producer: Producer<'a, u8, N>,
}

impl<'a, const N: usize> RxProducer<'a, N> {
    /// Store a received byte, dropping it if the queue is full.
    pub fn push(&mut self, byte: u8) -> Pushed {
        match self.producer.enqueue(byte) {
            Ok(()) => Pushed::Stored,
            Err(_) => Pushed::Dropped,
        }
    }
}

pub struct RxConsumer<'a, const N: usize> {
    consumer: Consumer<'a, u8, N>,
}

impl<'a, const N: usize> RxConsumer<'a, N> {
    /// Next received byte, if any.
    pub fn pop(&mut self) -> Option<u8> {
        self.consumer.dequeue()
    }

    pub fn len(&self) -> usize {
        self.consumer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [`SerialPort`] made of a receive queue and a blocking transmitter.
pub struct BufferedSerial<'a, W, E, const N: usize> {
    rx: RxConsumer<'a, N>,
    tx: W,
    _err: PhantomData<E>,
}

impl<'a, W, E, const N: usize> BufferedSerial<'a, W, E, N>
where
    W: Write<u8, Error = E>,
{
    pub fn new(rx: RxConsumer<'a, N>, tx: W) -> Self {
        Self {
            rx,
            tx,
            _err: PhantomData,
        }
    }

    pub fn transmitter(&self) -> &W {
        &self.tx
    }
}

impl<'a, W, E, const N: usize> Read<u8> for BufferedSerial<'a, W, E, N>
where
    W: Write<u8, Error = E>,
{
    type Error = E;

    fn read(&mut self) -> nb::Result<u8, E> {
        self.rx.pop().ok_or(nb::Error::WouldBlock)
    }
}

impl<'a, W, E, const N: usize> Write<u8> for BufferedSerial<'a, W, E, N>
where
    W: Write<u8, Error = E>,
{
    type Error = E;

    fn write(&mut self, word: u8) -> nb::Result<(), E> {
        self.tx.write(word)
    }

    fn flush(&mut self) -> nb::Result<(), E> {
        self.tx.flush()
    }
}

impl<'a, W, E, const N: usize> SerialPort<E> for BufferedSerial<'a, W, E, N>
where
    W: Write<u8, Error = E>,
{
    fn close(&mut self) -> Result<(), E> {
        nb::block!(self.tx.flush())
    }
}
