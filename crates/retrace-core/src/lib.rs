mod bundle;
mod payload;
mod setup;

pub use bundle::{build_bundle, Bundle, BUNDLE_MAGIC, TRAILER_LEN};
pub use payload::{validated_relative_payload_path, PayloadEntry, ZipPayload};
pub use setup::{PackageMetadata, RuntimeRequirement, SetupData, SetupSection};

#[cfg(test)]
mod tests;
