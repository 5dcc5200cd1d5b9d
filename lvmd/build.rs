extern crate tonic_build;

fn main() {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    tonic_build::configure()
        .build_server(true)
        .compile(&["proto/lvmd.proto"], &["proto"])
        .unwrap_or_else(|e| panic!("lvmd protobuf compilation failed: {}", e));
}
