fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // ESP-IDF environment (linker args, sysroot) is only needed for the
    // device build; host builds and tests skip it.
    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}
