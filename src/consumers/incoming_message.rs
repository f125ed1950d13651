use crate::transport::Delivery;

/// A message pushed to a consumer, ready for processing.
///
/// `Incoming` is the input type of message handlers (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
#[derive(Debug, Clone, Copy)]
pub struct Incoming<'d> {
    /// `message` is what we received from RabbitMq: it includes headers, payload, delivery tag, etc.
    pub message: &'d Delivery,
    /// The name of the queue.
    pub queue_name: &'d str,
}

impl<'d> Incoming<'d> {
    /// The payload of the message.
    pub fn data(&self) -> &'d [u8] {
        &self.message.data
    }
}
