fn main() {
    // gRPC server for the provider and the client used by tests and tooling
    build_provider();
}

fn build_provider() {
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .out_dir("src/provider")
        .compile_protos(&["proto/provider/v1alpha1/service.proto"], &["proto"])
        .expect("failed to compile protos");
}
