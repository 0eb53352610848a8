fn main() {
	let rustc = rustc_version::version()
		.map(|v| v.to_string())
		.unwrap_or_else(|_| "unknown".to_string());
	println!("cargo:rustc-env=PROXYPOOL_BUILD_RUSTC_VERSION={rustc}");

	let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
	println!("cargo:rustc-env=PROXYPOOL_BUILD_PROFILE_NAME={profile}");
}
