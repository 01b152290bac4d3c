//! Generation prompts for book renders and transition clips.
//!
//! Every prompt lives here so a wording change touches exactly one place and
//! tests can inspect the text without calling a provider. Which prompt a task
//! uses is decided by the plan ([`crate::schedule::ImagePrompt`]) and by the
//! video key ([`crate::model::VideoKey`]).

use crate::model::VideoKey;
use crate::schedule::ImagePrompt;

/// Cover page → photorealistic 3D render of the closed book.
pub const COVER_PROMPT: &str = r#"Create a photorealistic 3D render of the book based on the provided cover design.

Book Specifications:
Analyze the uploaded cover to determine the layout dimensions (vertical/square/horizontal format)
Page count: 24 pages
Calculate appropriate spine thickness based on page count (approximately page count ÷ 4 in millimeters)

3D Book Presentation:
Position the book at a three-quarter angle view, slightly tilted to showcase both the front cover and spine simultaneously
The book should appear resting on a surface with natural depth and dimension
Apply photorealistic lighting that creates subtle shadows beneath the book and gentle highlights on the cover surface
Show slight page separation visible at the top edge to demonstrate the book's physical depth

Environment Design:
Create a soft, minimalist photography studio setting with a clean, neutral backdrop
Generate a gentle gradient background using 2-3 complementary colors extracted from the book's cover palette
Ensure the background subtly echoes the book's visual theme without competing with or distracting from the main subject
Apply diffused natural lighting from the upper left, creating soft shadows that enhance three-dimensionality
Keep the environment professional and clean, resembling premium product photography where the book is the hero element

Camera & Composition:
Medium shot with shallow depth of field
Eye-level perspective with slight downward angle
Position the book to occupy approximately 60-70% of the frame
Maintain crisp focus on the book cover with gentle background blur for visual separation

Output Style: The final render should resemble premium product photography for a publisher's catalog—clean, professional, inviting, and emphasizing the book's physical quality and cover design artistry."#;

/// First spread → open book, styled after the cover render.
pub const FIRST_INTERIOR_PROMPT: &str = r#"Create a photorealistic 3D render of an open book showing two interior pages, using the provided 3D book cover as a reference for style, environment, and physical properties.

Reference Analysis:
Analyze the provided 3D book cover image to understand the book's physical dimensions, cover finish, spine thickness, and environmental setting
Match the exact lighting setup, background gradient colors, and studio atmosphere from the reference 3D cover
Maintain complete visual consistency with the established photographic style

Book Interior Specifications:
Display the book fully open and lying completely flat. The book is viewed from directly overhead with the camera looking straight down, both pages equally visible in a top-down perspective.
Avoid dramatic angles, side views, or tilted perspectives
The two pages should appear as adjacent spreads in the open book
Show natural page curvature where the pages meet at the spine, with subtle shadowing in the gutter (center crease)
Pages should have photorealistic lighting that creates soft shadows in the spine gutter and subtle highlights on the paper surface
ALWAYS depict text page on the left and image page on the right 
The book should fill 70-80% of the frame with even margins around all edges
Keep the horizon line level and straight—no diagonal or skewed compositions

Environment Matching:
Use the identical gradient background colors and tones from the provided 3D book cover reference
Match the lighting direction, intensity, and softness from the reference image
Keep the background appropriately blurred to ensure the open pages remain the focal point
The overall atmosphere should feel like a continuation of the same photoshoot from the 3D cover image

Output Style: The final render should appear as if it's from the same professional product photography session as the 3D cover reference—maintaining identical environmental conditions, lighting quality, and photographic style for complete visual cohesion. The camera angle should be consistent, professional, and flattering, showing the open book in a clear, readable overhead perspective."#;

/// Later spreads → the first-spread render with new page content.
///
/// Sent with three images: the reference render, then the left and right
/// pages.
pub const REMAINING_INTERIOR_PROMPT: &str = r#"Using the 3 provided reference images, recreate the open book image while ONLY replacing the content on the two interior pages with the new page images provided.

Reference Images Provided:
Open book template image (showing book structure, lighting, angle, environment)
Left page flat image (new content for left page)
Right page flat image (new content for right page)

What MUST Stay Exactly the Same:
Book's physical position, angle, and orientation from reference image #1
Camera angle (top-down overhead perspective)
Book dimensions, spine thickness, and page curvature
Lighting direction, intensity, and shadow placement
Background gradient colors and blur
Gutter shadows and paper highlights
Page texture and paper quality
Environmental atmosphere and studio setting
Margins and framing (book fills 70-80% of frame)
Overall composition and spatial layout

What Changes:
Apply the left page flat image (#2) onto the left page of the open book
Apply the right page flat image (#3) onto the right page of the open book
Map these flat images naturally onto the book pages, respecting the page curvature at the spine and the perspective of the open book

Critical Requirements:
Maintain EXACT camera position and book placement from reference open book image
Keep identical lighting setup - shadows must fall in the same direction
Preserve the same page curvature and natural paper bend at the spine
The new page content should appear naturally printed on the pages, not pasted or floating
Match exact depth, perspective, and dimensional qualities from the reference
The result should look like the same physical book from the same photoshoot, just turned to different pages."#;

/// Closed book (cover render) → first open spread.
pub const OPENING_VIDEO_PROMPT: &str = r#"Create a video showing a book opening from closed to revealing the first interior page spread.
The entire book (including spine) rotates RIGHT by 90 degrees without opening. Then the book opens naturally and lays flat on the table surface, revealing interior pages.

CRITICAL - Static Content:
1. No human hands visible.
2. All illustrations and text inside the book must remain completely still and frozen. No animated characters, no moving objects inside the pages. The images are printed on paper.
3. All text sharp and readable
4. DO NOT ADD OR CHANGE ANYTHING IN THE SCENE. KEEP ALL SAME"#;

/// Spread `n` → spread `n + 1`, one page turning right to left.
pub const PAGE_FLIP_VIDEO_PROMPT: &str = r#"Animate the book's interior book pages turning from one spread to the next.
Right page lifts and turns LEFT, revealing next spread
Left page stays anchored and stationary

CRITICAL: 
1. All illustrations and text inside the book must remain completely still and frozen. No animated characters, no moving objects inside the pages. The images are printed on paper.
2. DO NOT add or change anything in the scene
3. Page Turning RIGHT TO LEFT
4. Only ONE SINGLE page turns (the right page)-NOT multiple pages, NOT a bunch of pages—just ONE page
5. NO human hands, NO fingers, NO objects touching the page"#;

/// Prompt text for an image task.
pub fn image_prompt(kind: ImagePrompt) -> &'static str {
    match kind {
        ImagePrompt::Cover => COVER_PROMPT,
        ImagePrompt::FirstInterior => FIRST_INTERIOR_PROMPT,
        ImagePrompt::RemainingInterior => REMAINING_INTERIOR_PROMPT,
    }
}

/// Prompt text for a video key.
pub fn video_prompt(key: VideoKey) -> &'static str {
    match key {
        VideoKey::Opening => OPENING_VIDEO_PROMPT,
        VideoKey::Flip(_) => PAGE_FLIP_VIDEO_PROMPT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_are_non_empty() {
        for p in [
            COVER_PROMPT,
            FIRST_INTERIOR_PROMPT,
            REMAINING_INTERIOR_PROMPT,
            OPENING_VIDEO_PROMPT,
            PAGE_FLIP_VIDEO_PROMPT,
        ] {
            assert!(p.len() > 100);
        }
    }

    #[test]
    fn remaining_interior_prompt_expects_three_images() {
        assert!(image_prompt(ImagePrompt::RemainingInterior).contains("3 provided reference images"));
    }

    #[test]
    fn flip_prompt_turns_a_single_page() {
        let p = video_prompt(VideoKey::Flip(4));
        assert!(p.contains("ONE SINGLE page"));
        assert_ne!(p, video_prompt(VideoKey::Opening));
    }
}
