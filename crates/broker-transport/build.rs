// Build script for broker-transport.
// Compiles the terminal rendezvous protocol to src/generated.

fn main() {
    compile_protos();

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=protos/");
}

fn compile_protos() {
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true) // client generation needed for in-process tests
        .out_dir("src/generated")
        .compile_protos(&["protos/terminal.proto"], &["protos/"])
        .unwrap_or_else(|e| panic!("Failed to compile protos: {}", e));

    println!("cargo:warning=Successfully compiled terminal.proto");
}
