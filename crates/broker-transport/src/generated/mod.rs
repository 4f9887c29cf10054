// `terminal.proto` declares no `package`, so tonic-prost-build emits the
// generated module at `_.rs` rather than under a namespaced path.
include!("_.rs");
