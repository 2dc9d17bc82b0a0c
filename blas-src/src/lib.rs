//! Links the BLAS/LAPACK implementation used by `ndarray-linalg` across the workspace.
//! Accelerate on macOS, statically-linked sequential MKL everywhere else.

#[cfg(target_os = "macos")]
extern crate accelerate_src;

#[cfg(not(target_os = "macos"))]
extern crate intel_mkl_src;
