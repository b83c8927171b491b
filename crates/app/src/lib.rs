//! Edge OCR: camera frames in, spoken and tactile text out.

pub mod monitor;
pub mod ocr;
pub mod output;
