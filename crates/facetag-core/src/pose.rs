//! Approximate head pose from five-point landmarks.
//!
//! Geometry only: roll from the eye line, yaw from the nose's horizontal
//! offset against the eye midpoint, pitch from where the nose sits between
//! the eye line and the mouth line. Good enough to flag profile or tilted
//! faces; not a calibrated 3D estimate.

use crate::types::Landmarks;

/// Nose-to-eye-line distance over mouth-to-eye-line distance for a frontal
/// face, taken from the ArcFace reference landmarks.
const FRONTAL_NOSE_RATIO: f32 = 0.495;
const MIN_EYE_DISTANCE: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

/// Estimate yaw/pitch/roll in degrees. `None` when the eyes coincide.
pub fn estimate_pose(landmarks: &Landmarks) -> Option<Pose> {
    let [left_eye, right_eye, nose, left_mouth, right_mouth] = *landmarks;

    let ex = right_eye.0 - left_eye.0;
    let ey = right_eye.1 - left_eye.1;
    let eye_distance = (ex * ex + ey * ey).sqrt();
    if eye_distance < MIN_EYE_DISTANCE {
        return None;
    }

    let roll = ey.atan2(ex);
    let (sin_r, cos_r) = roll.sin_cos();
    // Rotate into the face frame so the eye line is horizontal.
    let derotate = |p: (f32, f32), origin: (f32, f32)| {
        let dx = p.0 - origin.0;
        let dy = p.1 - origin.1;
        (dx * cos_r + dy * sin_r, -dx * sin_r + dy * cos_r)
    };

    let eye_mid = midpoint(left_eye, right_eye);
    let mouth_mid = midpoint(left_mouth, right_mouth);
    let (nose_dx, nose_dy) = derotate(nose, eye_mid);
    let (_, mouth_dy) = derotate(mouth_mid, eye_mid);

    let yaw = (2.0 * nose_dx / eye_distance).clamp(-1.0, 1.0).asin();
    let pitch = if mouth_dy.abs() > MIN_EYE_DISTANCE {
        let ratio = nose_dy / mouth_dy;
        ((ratio - FRONTAL_NOSE_RATIO) * 2.0).clamp(-1.0, 1.0).asin()
    } else {
        0.0
    };

    Some(Pose {
        yaw: yaw.to_degrees(),
        pitch: pitch.to_degrees(),
        roll: roll.to_degrees(),
    })
}

fn midpoint(a: (f32, f32), b: (f32, f32)) -> (f32, f32) {
    ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0)
}
