//! Post-run classification of images as unique or shared

use crate::report::ImageResult;
use crate::scan_cache::LayerRegistry;

/// Mark every image that shares at least one layer with another image.
///
/// Must run after all images are processed so the reference counts are
/// final. Images without layers stay unique. Returns how many images were
/// marked shared.
pub fn resolve(images: &mut [ImageResult], registry: &LayerRegistry) -> usize {
    let mut shared = 0;
    for image in images.iter_mut() {
        if image
            .layer_ids
            .iter()
            .any(|layer| registry.reference_count(layer) > 1)
        {
            image.unique = false;
            shared += 1;
        }
    }
    shared
}
