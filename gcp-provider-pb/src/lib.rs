/// gRPC server and client for the `v1alpha1.CSIDriverProvider` service, plus its protobuf
/// objects. Regenerate with `cargo run -p gcp-provider-pb` after editing the proto.
pub mod provider;
