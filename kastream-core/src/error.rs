use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Codec Error - {0}")]
    Codec(String),

    #[error("No codec registered for topic '{0}'")]
    CodecMissing(String),

    #[error("Broker Error - {0}")]
    Broker(String),

    #[error("Producer Error - {0}")]
    Producer(String),

    #[error("Offset Manager Error - {0}")]
    OffsetManager(String),

    #[error("Processor Error - {0}")]
    Processor(String),

    // An ack that cannot be matched to an in-flight record means the
    // in-flight bookkeeping is corrupt; callers must treat this as fatal.
    #[error("Ack Error - {0}")]
    Ack(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}
