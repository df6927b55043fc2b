// datafetch-storage - the bundle storage pipeline
//
// A chain of decorators terminated by an object-store sink:
// - opendal-backed sink (S3 / filesystem / in-memory) with streaming
//   multipart uploads and a terminating bundle metadata object
// - tee primitive producing N bounded lazy readers over one source
// - tar/gz and zip decorators that extract derived resources on the fly
// - pipeline storage adding crash-durable completion notifications
//
// Wiring order (outermost first): pipeline -> decorators -> sink.

pub mod object_store;
pub mod pipeline;
pub mod targz;
pub mod tee;
pub mod unzip;

#[cfg(test)]
pub(crate) mod testing;

pub use object_store::ObjectStoreStorage;
pub use pipeline::PipelineStorage;
pub use targz::TarGzDecorator;
pub use tee::tee;
pub use unzip::UnzipDecorator;
