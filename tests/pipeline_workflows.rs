//! End-to-end pipeline workflows through `CutoutSession`
//!
//! A fake model stands in for `ISNet` so segment, mask, refine and
//! composite run for real without downloading weights.

mod common;

use common::{adapter, encode_png, gradient_image, solid_image, FakeLoader, Pattern};
use image::Rgba;
use imgly_cutout::{
    cutout_from_bytes, Backdrop, CutoutSession, DilationStrategy, FeatherConfig, OutputFormat,
    PipelineConfig, ProcessOutcome, QualityTier, RefinementConfig, Threshold,
};
use std::sync::Arc;

fn session(pattern: Pattern) -> (Arc<FakeLoader>, CutoutSession) {
    let loader = Arc::new(FakeLoader::new(pattern));
    let session = CutoutSession::new(adapter(&loader));
    (loader, session)
}

#[tokio::test]
async fn test_full_mask_over_red_backdrop_equals_source() {
    let (_, session) = session(Pattern::Constant(1.0));
    let source = gradient_image(100, 100);
    let token = session.load(source.clone());

    let config = PipelineConfig::builder()
        .backdrop(Backdrop::Color([255, 0, 0]))
        .build()
        .unwrap();
    let result = session.process(token, &config).await.unwrap().into_result().unwrap();

    assert_eq!(result.dimensions(), (100, 100));
    assert_eq!(result.image(), source.as_rgba());
    assert!(result.has_opaque_backdrop());
}

#[tokio::test]
async fn test_empty_mask_with_transparent_backdrop_is_fully_transparent() {
    let (_, session) = session(Pattern::Constant(0.0));
    let token = session.load(gradient_image(100, 100));

    let result = session
        .process(token, &PipelineConfig::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert!(result.image().pixels().all(|p| p[3] == 0));
}

#[tokio::test]
async fn test_background_pixels_are_transparent_without_feather() {
    let (_, session) = session(Pattern::CenterSquare);
    let source = gradient_image(64, 64);
    let token = session.load(source.clone());

    let result = session
        .process(token, &PipelineConfig::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    // Model square 32 covers the source at scale 0.5; center half is foreground
    assert_eq!(result.image().get_pixel(0, 0)[3], 0);
    assert_eq!(result.image().get_pixel(63, 63)[3], 0);
    assert_eq!(result.image().get_pixel(32, 32), source.as_rgba().get_pixel(32, 32));

    let opaque = result.image().pixels().filter(|p| p[3] == 255).count();
    assert!(opaque > 0 && opaque < 64 * 64);
    assert!(result.image().pixels().all(|p| p[3] == 0 || p[3] == 255));
}

#[tokio::test]
async fn test_result_dimensions_match_source() {
    let (_, session) = session(Pattern::CenterSquare);
    let config = PipelineConfig::builder()
        .dilation_radius(2)
        .feather(FeatherConfig::new(1.5, 0.5))
        .backdrop(Backdrop::Color([0, 0, 255]))
        .build()
        .unwrap();

    for (width, height) in [(1, 1), (1, 9), (7, 3), (33, 17), (120, 40)] {
        let token = session.load(gradient_image(width, height));
        let result = session.process(token, &config).await.unwrap().into_result().unwrap();
        assert_eq!(result.dimensions(), (width, height), "{}x{}", width, height);
    }
}

#[tokio::test]
async fn test_compositing_is_deterministic() {
    let (_, session) = session(Pattern::CenterSquare);
    let config = PipelineConfig::builder()
        .dilation_strategy(DilationStrategy::BlurThreshold)
        .dilation_radius(3)
        .feather(FeatherConfig::new(2.0, 0.7))
        .build()
        .unwrap();

    let source = gradient_image(48, 30);
    let first = {
        let token = session.load(source.clone());
        session.process(token, &config).await.unwrap().into_result().unwrap()
    };
    let second = {
        let token = session.load(source);
        session.process(token, &config).await.unwrap().into_result().unwrap()
    };

    assert_eq!(first.image(), second.image());
}

#[tokio::test]
async fn test_dilation_grows_visible_region() {
    let (_, session) = session(Pattern::CenterSquare);
    let source = gradient_image(64, 64);

    let visible = |result: &imgly_cutout::CompositeResult| {
        result.image().pixels().filter(|p| p[3] > 0).count()
    };

    let token = session.load(source.clone());
    let plain = session
        .process(token, &PipelineConfig::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let dilated_config = PipelineConfig {
        refinement: RefinementConfig {
            strategy: DilationStrategy::NeighborExpansion,
            radius: 3,
        },
        ..PipelineConfig::default()
    };
    let dilated = session
        .process(token, &dilated_config)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert!(visible(&dilated) > visible(&plain));
}

#[tokio::test]
async fn test_backdrop_change_reuses_labels() {
    let (loader, session) = session(Pattern::CenterSquare);
    let token = session.load(gradient_image(40, 40));

    let transparent = PipelineConfig::default();
    let colored = PipelineConfig::builder()
        .backdrop(Backdrop::Color([10, 200, 10]))
        .build()
        .unwrap();

    session.process(token, &transparent).await.unwrap();
    let recolored = session.process(token, &colored).await.unwrap().into_result().unwrap();
    assert_eq!(loader.inferences(), 1);
    assert_eq!(recolored.timings.segmentation_ms, 0);
    assert_eq!(*recolored.image().get_pixel(0, 0), Rgba([10, 200, 10, 255]));

    let stricter = PipelineConfig {
        threshold: Threshold::new(0.9).unwrap(),
        ..PipelineConfig::default()
    };
    session.process(token, &stricter).await.unwrap();
    assert_eq!(loader.inferences(), 2);
    assert_eq!(loader.loads(), 1);
}

#[tokio::test]
async fn test_new_load_supersedes_in_flight_run() {
    let loader = Arc::new(FakeLoader::new(Pattern::Constant(1.0)).gated());
    let session = CutoutSession::new(adapter(&loader));
    let first = session.load(solid_image(10, 10, [1, 2, 3, 255]));

    let config = PipelineConfig::default();
    let (outcome, second) = tokio::join!(session.process(first, &config), async {
        while loader.loads() == 0 {
            tokio::task::yield_now().await;
        }
        let second = session.load(solid_image(20, 20, [4, 5, 6, 255]));
        loader.release();
        second
    });

    assert!(matches!(outcome.unwrap(), ProcessOutcome::Superseded));
    assert!(session.result().is_none());
    assert!(session.is_current(second));

    let result = session.process(second, &config).await.unwrap().into_result().unwrap();
    assert_eq!(result.dimensions(), (20, 20));
    assert_eq!(session.result().unwrap().dimensions(), (20, 20));
}

#[tokio::test]
async fn test_download_formats() {
    let (_, session) = session(Pattern::CenterSquare);
    let token = session.load_bytes(&encode_png(&gradient_image(30, 20))).unwrap();

    let config = PipelineConfig::builder()
        .backdrop(Backdrop::Color([255, 255, 255]))
        .output_format(OutputFormat::Jpeg)
        .build()
        .unwrap();
    session.process(token, &config).await.unwrap();

    let jpeg = session.download(OutputFormat::Jpeg, QualityTier::Medium).unwrap();
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (30, 20));

    let png = session.download(OutputFormat::Png, QualityTier::Low).unwrap();
    let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
    assert_eq!(decoded, *session.result().unwrap().image());
}

#[tokio::test]
async fn test_cutout_from_bytes() {
    let loader = Arc::new(FakeLoader::new(Pattern::Constant(1.0)));
    let adapter = adapter(&loader);
    let source = solid_image(12, 8, [90, 80, 70, 255]);

    let result = cutout_from_bytes(&adapter, &encode_png(&source), &PipelineConfig::default())
        .await
        .unwrap();
    assert_eq!(result.image(), source.as_rgba());
    assert!(!result.has_opaque_backdrop());
}
