fn main() {
    println!("cargo::rerun-if-changed=build.rs");
    // libdiag.so resolves pthread_create against the executable, so our
    // interposer has to be in the dynamic symbol table
    if std::env::var_os("CARGO_FEATURE_LIBDIAG").is_some() {
        println!("cargo::rustc-link-arg-bins=-rdynamic");
    }
}
