//! Module registrations for the reference server.

use gantry::Kernel;

mod blog;
mod landing;
mod powered;

/// Register every module, controller, middleware and extension this
/// server ships. Setup descriptors reference them by these keys.
pub fn register(kernel: &mut Kernel) {
    powered::register(kernel);
    landing::register(kernel);
    blog::register(kernel);
}
