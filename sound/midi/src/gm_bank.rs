//! General MIDI FM patches: 128 melodic programs followed by the 53 GM
//! percussion keys 35-87.

use crate::instruments::FmInstrument;

pub(crate) static GM_BANK: [FmInstrument; 181] = [
    // Melodic
    FmInstrument::new("Acoustic Grand Piano", [1, 143, 242, 244, 0], [1, 6, 242, 247, 0], 56, 0),
    FmInstrument::new("Bright Acoustic Grand", [1, 75, 242, 244, 0], [1, 0, 242, 247, 0], 56, 0),
    FmInstrument::new("Electric Grand Piano", [1, 73, 242, 244, 0], [1, 0, 242, 246, 0], 56, 0),
    FmInstrument::new("Honky-tonk Piano", [129, 18, 242, 247, 0], [65, 0, 242, 247, 0], 54, 0),
    FmInstrument::new("Rhodes Piano", [1, 87, 241, 247, 0], [1, 0, 242, 247, 0], 48, 0),
    FmInstrument::new("Chorused Piano", [1, 147, 241, 247, 0], [1, 0, 242, 247, 0], 48, 0),
    FmInstrument::new("Harpsichord", [1, 128, 161, 242, 0], [22, 14, 242, 245, 0], 56, 0),
    FmInstrument::new("Clavinet", [1, 146, 194, 248, 0], [1, 0, 194, 248, 0], 58, 0),
    FmInstrument::new("Celesta", [12, 92, 246, 244, 0], [129, 0, 243, 245, 0], 48, 0),
    FmInstrument::new("Glockenspiel", [7, 151, 243, 242, 0], [17, 128, 242, 241, 0], 50, 0),
    FmInstrument::new("Music box", [23, 33, 84, 244, 0], [1, 0, 244, 244, 0], 50, 0),
    FmInstrument::new("Vibraphone", [152, 98, 243, 246, 0], [129, 0, 242, 246, 0], 48, 0),
    FmInstrument::new("Marimba", [24, 35, 246, 246, 0], [1, 0, 231, 247, 0], 48, 0),
    FmInstrument::new("Xylophone", [21, 145, 246, 246, 0], [1, 0, 246, 246, 0], 52, 0),
    FmInstrument::new("Tubular Bells", [69, 89, 211, 243, 0], [129, 128, 163, 243, 0], 60, 0),
    FmInstrument::new("Dulcimer", [3, 73, 117, 245, 1], [129, 128, 181, 245, 0], 52, 0),
    FmInstrument::new("Hammond Organ", [113, 146, 246, 20, 0], [49, 0, 241, 7, 0], 50, 0),
    FmInstrument::new("Percussive Organ", [114, 20, 199, 88, 0], [48, 0, 199, 8, 0], 50, 0),
    FmInstrument::new("Rock Organ", [112, 68, 170, 24, 0], [177, 0, 138, 8, 0], 52, 0),
    FmInstrument::new("Church Organ", [35, 147, 151, 35, 1], [177, 0, 85, 20, 0], 52, 0),
    FmInstrument::new("Reed Organ", [97, 19, 151, 4, 1], [177, 128, 85, 4, 0], 48, 0),
    FmInstrument::new("Accordion", [36, 72, 152, 42, 1], [177, 0, 70, 26, 0], 60, 0),
    FmInstrument::new("Harmonica", [97, 19, 145, 6, 1], [33, 0, 97, 7, 0], 58, 0),
    FmInstrument::new("Tango Accordion", [33, 19, 113, 6, 0], [161, 137, 97, 7, 0], 54, 0),
    FmInstrument::new("Acoustic Guitar1", [2, 156, 243, 148, 1], [65, 128, 243, 200, 0], 60, 0),
    FmInstrument::new("Acoustic Guitar2", [3, 84, 243, 154, 1], [17, 0, 241, 231, 0], 60, 0),
    FmInstrument::new("Electric Guitar1", [35, 95, 241, 58, 0], [33, 0, 242, 248, 0], 48, 0),
    FmInstrument::new("Electric Guitar2", [3, 135, 246, 34, 1], [33, 128, 243, 248, 0], 54, 0),
    FmInstrument::new("Electric Guitar3", [3, 71, 249, 84, 0], [33, 0, 246, 58, 0], 48, 0),
    FmInstrument::new("Overdrive Guitar", [35, 74, 145, 65, 1], [33, 5, 132, 25, 0], 56, 0),
    FmInstrument::new("Distortion Guitar", [35, 74, 149, 25, 1], [33, 0, 148, 25, 0], 56, 0),
    FmInstrument::new("Guitar Harmonics", [9, 161, 32, 79, 0], [132, 128, 209, 248, 0], 56, 0),
    FmInstrument::new("Acoustic Bass", [33, 30, 148, 6, 0], [162, 0, 195, 166, 0], 50, 0),
    FmInstrument::new("Electric Bass 1", [49, 18, 241, 40, 0], [49, 0, 241, 24, 0], 58, 0),
    FmInstrument::new("Electric Bass 2", [49, 141, 241, 232, 0], [49, 0, 241, 120, 0], 58, 0),
    FmInstrument::new("Fretless Bass", [49, 91, 81, 40, 0], [50, 0, 113, 72, 0], 60, 0),
    FmInstrument::new("Slap Bass 1", [1, 139, 161, 154, 0], [33, 64, 242, 223, 0], 56, 0),
    FmInstrument::new("Slap Bass 2", [33, 139, 162, 22, 0], [33, 8, 161, 223, 0], 56, 0),
    FmInstrument::new("Synth Bass 1", [49, 139, 244, 232, 0], [49, 0, 241, 120, 0], 58, 0),
    FmInstrument::new("Synth Bass 2", [49, 18, 241, 40, 0], [49, 0, 241, 24, 0], 58, 0),
    FmInstrument::new("Violin", [49, 21, 221, 19, 1], [33, 0, 86, 38, 0], 56, 0),
    FmInstrument::new("Viola", [49, 22, 221, 19, 1], [33, 0, 102, 6, 0], 56, 0),
    FmInstrument::new("Cello", [113, 73, 209, 28, 1], [49, 0, 97, 12, 0], 56, 0),
    FmInstrument::new("Contrabass", [33, 77, 113, 18, 1], [35, 128, 114, 6, 0], 50, 0),
    FmInstrument::new("Tremulo Strings", [241, 64, 241, 33, 1], [225, 0, 111, 22, 0], 50, 0),
    FmInstrument::new("Pizzicato String", [2, 26, 245, 117, 1], [1, 128, 133, 53, 0], 48, 0),
    FmInstrument::new("Orchestral Harp", [2, 29, 245, 117, 1], [1, 128, 243, 244, 0], 48, 0),
    FmInstrument::new("Timpany", [16, 65, 245, 5, 1], [17, 0, 242, 195, 0], 50, 0),
    FmInstrument::new("String Ensemble1", [33, 155, 177, 37, 1], [162, 1, 114, 8, 0], 62, 0),
    FmInstrument::new("String Ensemble2", [161, 152, 127, 3, 1], [33, 0, 63, 7, 1], 48, 0),
    FmInstrument::new("Synth Strings 1", [161, 147, 193, 18, 0], [97, 0, 79, 5, 0], 58, 0),
    FmInstrument::new("SynthStrings 2", [33, 24, 193, 34, 0], [97, 0, 79, 5, 0], 60, 0),
    FmInstrument::new("Choir Aahs", [49, 91, 244, 21, 0], [114, 131, 138, 5, 0], 48, 0),
    FmInstrument::new("Voice Oohs", [161, 144, 116, 57, 0], [97, 0, 113, 103, 0], 48, 0),
    FmInstrument::new("Synth Voice", [113, 87, 84, 5, 0], [114, 0, 122, 5, 0], 60, 0),
    FmInstrument::new("Orchestra Hit", [144, 0, 84, 99, 0], [65, 0, 165, 69, 0], 56, 0),
    FmInstrument::new("Trumpet", [33, 146, 133, 23, 0], [33, 1, 143, 9, 0], 60, 0),
    FmInstrument::new("Trombone", [33, 148, 117, 23, 0], [33, 5, 143, 9, 0], 60, 0),
    FmInstrument::new("Tuba", [33, 148, 118, 21, 0], [97, 0, 130, 55, 0], 60, 0),
    FmInstrument::new("Muted Trumpet", [49, 67, 158, 23, 1], [33, 0, 98, 44, 1], 50, 0),
    FmInstrument::new("French Horn", [33, 155, 97, 106, 0], [33, 0, 127, 10, 0], 50, 0),
    FmInstrument::new("Brass Section", [97, 138, 117, 31, 0], [34, 6, 116, 15, 0], 56, 0),
    FmInstrument::new("Synth Brass 1", [161, 134, 114, 85, 1], [33, 131, 113, 24, 0], 48, 0),
    FmInstrument::new("Synth Brass 2", [33, 77, 84, 60, 0], [33, 0, 166, 28, 0], 56, 0),
    FmInstrument::new("Soprano Sax", [49, 143, 147, 2, 1], [97, 0, 114, 11, 0], 56, 0),
    FmInstrument::new("Alto Sax", [49, 142, 147, 3, 1], [97, 0, 114, 9, 0], 56, 0),
    FmInstrument::new("Tenor Sax", [49, 145, 147, 3, 1], [97, 0, 130, 9, 0], 58, 0),
    FmInstrument::new("Baritone Sax", [49, 142, 147, 15, 1], [97, 0, 114, 15, 0], 58, 0),
    FmInstrument::new("Oboe", [33, 75, 170, 22, 1], [33, 0, 143, 10, 0], 56, 0),
    FmInstrument::new("English Horn", [49, 144, 126, 23, 1], [33, 0, 139, 12, 1], 54, 0),
    FmInstrument::new("Bassoon", [49, 129, 117, 25, 1], [50, 0, 97, 25, 0], 48, 0),
    FmInstrument::new("Clarinet", [50, 144, 155, 33, 0], [33, 0, 114, 23, 0], 52, 0),
    FmInstrument::new("Piccolo", [225, 31, 133, 95, 0], [225, 0, 101, 26, 0], 48, 0),
    FmInstrument::new("Flute", [225, 70, 136, 95, 0], [225, 0, 101, 26, 0], 48, 0),
    FmInstrument::new("Recorder", [161, 156, 117, 31, 0], [33, 0, 117, 10, 0], 50, 0),
    FmInstrument::new("Pan Flute", [49, 139, 132, 88, 0], [33, 0, 101, 26, 0], 48, 0),
    FmInstrument::new("Bottle Blow", [225, 76, 102, 86, 0], [161, 0, 101, 38, 0], 48, 0),
    FmInstrument::new("Shakuhachi", [98, 203, 118, 70, 0], [161, 0, 85, 54, 0], 48, 0),
    FmInstrument::new("Whistle", [98, 153, 87, 7, 0], [161, 0, 86, 7, 0], 59, 0),
    FmInstrument::new("Ocarina", [98, 147, 119, 7, 0], [161, 0, 118, 7, 0], 59, 0),
    FmInstrument::new("Lead 1 squareea", [34, 89, 255, 3, 2], [33, 0, 255, 15, 0], 48, 0),
    FmInstrument::new("Lead 2 sawtooth", [33, 14, 255, 15, 1], [33, 0, 255, 15, 1], 48, 0),
    FmInstrument::new("Lead 3 calliope", [34, 70, 134, 85, 0], [33, 128, 100, 24, 0], 48, 0),
    FmInstrument::new("Lead 4 chiff", [33, 69, 102, 18, 0], [161, 0, 150, 10, 0], 48, 0),
    FmInstrument::new("Lead 5 charang", [33, 139, 146, 42, 1], [34, 0, 145, 42, 0], 48, 0),
    FmInstrument::new("Lead 6 voice", [162, 158, 223, 5, 0], [97, 64, 111, 7, 0], 50, 0),
    FmInstrument::new("Lead 7 fifths", [32, 26, 239, 1, 0], [96, 0, 143, 6, 2], 48, 0),
    FmInstrument::new("Lead 8 brass", [33, 143, 241, 41, 0], [33, 128, 244, 9, 0], 58, 0),
    FmInstrument::new("Pad 1 new age", [119, 165, 83, 148, 0], [161, 0, 160, 5, 0], 50, 0),
    FmInstrument::new("Pad 2 warm", [97, 31, 168, 17, 0], [177, 128, 37, 3, 0], 58, 0),
    FmInstrument::new("Pad 3 polysynth", [97, 23, 145, 52, 0], [97, 0, 85, 22, 0], 60, 0),
    FmInstrument::new("Pad 4 choir", [113, 93, 84, 1, 0], [114, 0, 106, 3, 0], 48, 0),
    FmInstrument::new("Pad 5 bowedpad", [33, 151, 33, 67, 0], [162, 0, 66, 53, 0], 56, 0),
    FmInstrument::new("Pad 6 metallic", [161, 28, 161, 119, 1], [33, 0, 49, 71, 1], 48, 0),
    FmInstrument::new("Pad 7 halo", [33, 137, 17, 51, 0], [97, 3, 66, 37, 0], 58, 0),
    FmInstrument::new("Pad 8 sweep", [161, 21, 17, 71, 1], [33, 0, 207, 7, 0], 48, 0),
    FmInstrument::new("FX 1 rain", [58, 206, 248, 246, 0], [81, 0, 134, 2, 0], 50, 0),
    FmInstrument::new("FX 2 soundtrack", [33, 21, 33, 35, 1], [33, 0, 65, 19, 0], 48, 0),
    FmInstrument::new("FX 3 crystal", [6, 91, 116, 149, 0], [1, 0, 165, 114, 0], 48, 0),
    FmInstrument::new("FX 4 atmosphere", [34, 146, 177, 129, 0], [97, 131, 242, 38, 0], 60, 0),
    FmInstrument::new("FX 5 brightness", [65, 77, 241, 81, 1], [66, 0, 242, 245, 0], 48, 0),
    FmInstrument::new("FX 6 goblins", [97, 148, 17, 81, 1], [163, 128, 17, 19, 0], 54, 0),
    FmInstrument::new("FX 7 echoes", [97, 140, 17, 49, 0], [161, 128, 29, 3, 0], 54, 0),
    FmInstrument::new("FX 8 sci-fi", [164, 76, 243, 115, 1], [97, 0, 129, 35, 0], 52, 0),
    FmInstrument::new("Sitar", [2, 133, 210, 83, 0], [7, 3, 242, 246, 1], 48, 0),
    FmInstrument::new("Banjo", [17, 12, 163, 17, 1], [19, 128, 162, 229, 0], 48, 0),
    FmInstrument::new("Shamisen", [17, 6, 246, 65, 1], [17, 0, 242, 230, 2], 52, 0),
    FmInstrument::new("Koto", [147, 145, 212, 50, 0], [145, 0, 235, 17, 1], 56, 0),
    FmInstrument::new("Kalimba", [4, 79, 250, 86, 0], [1, 0, 194, 5, 0], 60, 0),
    FmInstrument::new("Bagpipe", [33, 73, 124, 32, 0], [34, 0, 111, 12, 1], 54, 0),
    FmInstrument::new("Fiddle", [49, 133, 221, 51, 1], [33, 0, 86, 22, 0], 58, 0),
    FmInstrument::new("Shanai", [32, 4, 218, 5, 2], [33, 129, 143, 11, 0], 54, 0),
    FmInstrument::new("Tinkle Bell", [5, 106, 241, 229, 0], [3, 128, 195, 229, 0], 54, 0),
    FmInstrument::new("Agogo Bells", [7, 21, 236, 38, 0], [2, 0, 248, 22, 0], 58, 0),
    FmInstrument::new("Steel Drums", [5, 157, 103, 53, 0], [1, 0, 223, 5, 0], 56, 0),
    FmInstrument::new("Woodblock", [24, 150, 250, 40, 0], [18, 0, 248, 229, 0], 58, 0),
    FmInstrument::new("Taiko Drum", [16, 134, 168, 7, 0], [0, 3, 250, 3, 0], 54, 0),
    FmInstrument::new("Melodic Tom", [17, 65, 248, 71, 2], [16, 3, 243, 3, 0], 52, 0),
    FmInstrument::new("Synth Drum", [1, 142, 241, 6, 2], [16, 0, 243, 2, 0], 62, 0),
    FmInstrument::new("Reverse Cymbal", [14, 0, 31, 0, 0], [192, 0, 31, 255, 3], 62, 0),
    FmInstrument::new("Guitar FretNoise", [6, 128, 248, 36, 0], [3, 136, 86, 132, 2], 62, 0),
    FmInstrument::new("Breath Noise", [14, 0, 248, 0, 0], [208, 5, 52, 4, 3], 62, 0),
    FmInstrument::new("Seashore", [14, 0, 246, 0, 0], [192, 0, 31, 2, 3], 62, 0),
    FmInstrument::new("Bird Tweet", [213, 149, 55, 163, 0], [218, 64, 86, 55, 0], 48, 0),
    FmInstrument::new("Telephone", [53, 92, 178, 97, 2], [20, 8, 244, 21, 0], 58, 0),
    FmInstrument::new("Helicopter", [14, 0, 246, 0, 0], [208, 0, 79, 245, 3], 62, 0),
    FmInstrument::new("Applause/Noise", [38, 0, 255, 1, 0], [228, 0, 18, 22, 1], 62, 0),
    FmInstrument::new("Gunshot", [0, 0, 243, 240, 0], [0, 0, 246, 201, 2], 62, 0),
    // Percussion, key 35 upwards
    FmInstrument::new("Ac Bass Drum", [16, 68, 248, 119, 2], [17, 0, 243, 6, 0], 56, 35),
    FmInstrument::new("Bass Drum 1", [16, 68, 248, 119, 2], [17, 0, 243, 6, 0], 56, 35),
    FmInstrument::new("Side Stick", [2, 7, 249, 255, 0], [17, 0, 248, 255, 0], 56, 52),
    FmInstrument::new("Acoustic Snare", [0, 0, 252, 5, 2], [0, 0, 250, 23, 0], 62, 48),
    FmInstrument::new("Hand Clap", [0, 2, 255, 7, 0], [1, 0, 255, 8, 0], 48, 58),
    FmInstrument::new("Electric Snare", [0, 0, 252, 5, 2], [0, 0, 250, 23, 0], 62, 60),
    FmInstrument::new("Low Floor Tom", [0, 0, 246, 12, 0], [0, 0, 246, 6, 0], 52, 47),
    FmInstrument::new("Closed High Hat", [12, 0, 246, 8, 0], [18, 0, 251, 71, 2], 58, 43),
    FmInstrument::new("High Floor Tom", [0, 0, 246, 12, 0], [0, 0, 246, 6, 0], 52, 49),
    FmInstrument::new("Pedal High Hat", [12, 0, 246, 8, 0], [18, 5, 123, 71, 2], 58, 43),
    FmInstrument::new("Low Tom", [0, 0, 246, 12, 0], [0, 0, 246, 6, 0], 52, 51),
    FmInstrument::new("Open High Hat", [12, 0, 246, 2, 0], [18, 0, 203, 67, 2], 58, 43),
    FmInstrument::new("Low-Mid Tom", [0, 0, 246, 12, 0], [0, 0, 246, 6, 0], 52, 54),
    FmInstrument::new("High-Mid Tom", [0, 0, 246, 12, 0], [0, 0, 246, 6, 0], 52, 57),
    FmInstrument::new("Crash Cymbal 1", [14, 0, 246, 0, 0], [208, 0, 159, 2, 3], 62, 72),
    FmInstrument::new("High Tom", [0, 0, 246, 12, 0], [0, 0, 246, 6, 0], 52, 60),
    FmInstrument::new("Ride Cymbal 1", [14, 8, 248, 66, 0], [7, 74, 244, 228, 3], 62, 76),
    FmInstrument::new("Chinese Cymbal", [14, 0, 245, 48, 0], [208, 10, 159, 2, 0], 62, 84),
    FmInstrument::new("Ride Bell", [14, 10, 228, 228, 3], [7, 93, 245, 229, 1], 54, 36),
    FmInstrument::new("Tambourine", [2, 3, 180, 4, 0], [5, 10, 151, 247, 0], 62, 65),
    FmInstrument::new("Splash Cymbal", [78, 0, 246, 0, 0], [158, 0, 159, 2, 3], 62, 84),
    FmInstrument::new("Cow Bell", [17, 69, 248, 55, 2], [16, 8, 243, 5, 0], 56, 83),
    FmInstrument::new("Crash Cymbal 2", [14, 0, 246, 0, 0], [208, 0, 159, 2, 3], 62, 84),
    FmInstrument::new("Vibraslap", [128, 0, 255, 3, 3], [16, 13, 255, 20, 0], 60, 24),
    FmInstrument::new("Ride Cymbal 2", [14, 8, 248, 66, 0], [7, 74, 244, 228, 3], 62, 77),
    FmInstrument::new("High Bongo", [6, 11, 245, 12, 0], [2, 0, 245, 8, 0], 54, 60),
    FmInstrument::new("Low Bongo", [1, 0, 250, 191, 0], [2, 0, 200, 151, 0], 55, 65),
    FmInstrument::new("Mute High Conga", [1, 81, 250, 135, 0], [1, 0, 250, 183, 0], 54, 59),
    FmInstrument::new("Open High Conga", [1, 84, 250, 141, 0], [2, 0, 248, 184, 0], 54, 51),
    FmInstrument::new("Low Conga", [1, 89, 250, 136, 0], [2, 0, 248, 182, 0], 54, 45),
    FmInstrument::new("High Timbale", [1, 0, 249, 10, 3], [0, 0, 250, 6, 0], 62, 71),
    FmInstrument::new("Low Timbale", [0, 128, 249, 137, 3], [0, 0, 246, 108, 0], 62, 60),
    FmInstrument::new("High Agogo", [3, 128, 248, 136, 3], [12, 8, 246, 182, 0], 63, 58),
    FmInstrument::new("Low Agogo", [3, 133, 248, 136, 3], [12, 0, 246, 182, 0], 63, 53),
    FmInstrument::new("Cabasa", [14, 64, 118, 79, 0], [0, 8, 119, 24, 2], 62, 64),
    FmInstrument::new("Maracas", [14, 64, 200, 73, 0], [3, 0, 155, 105, 2], 62, 71),
    FmInstrument::new("Short Whistle", [215, 220, 173, 5, 3], [199, 0, 141, 5, 0], 62, 61),
    FmInstrument::new("Long Whistle", [215, 220, 168, 4, 3], [199, 0, 136, 4, 0], 62, 61),
    FmInstrument::new("Short Guiro", [128, 0, 246, 6, 3], [17, 0, 103, 23, 3], 62, 44),
    FmInstrument::new("Long Guiro", [128, 0, 245, 5, 2], [17, 9, 70, 22, 3], 62, 40),
    FmInstrument::new("Claves", [6, 63, 0, 244, 0], [21, 0, 247, 245, 0], 49, 69),
    FmInstrument::new("High Wood Block", [6, 63, 0, 244, 3], [18, 0, 247, 245, 0], 48, 68),
    FmInstrument::new("Low Wood Block", [6, 63, 0, 244, 0], [18, 0, 247, 245, 0], 49, 63),
    FmInstrument::new("Mute Cuica", [1, 88, 103, 231, 0], [2, 0, 117, 7, 0], 48, 74),
    FmInstrument::new("Open Cuica", [65, 69, 248, 72, 0], [66, 8, 117, 5, 0], 48, 60),
    FmInstrument::new("Mute Triangle", [10, 64, 224, 240, 3], [30, 78, 255, 5, 0], 56, 80),
    FmInstrument::new("Open Triangle", [10, 124, 224, 240, 3], [30, 82, 255, 2, 0], 56, 64),
    FmInstrument::new("Shaker", [14, 64, 122, 74, 0], [0, 8, 123, 27, 2], 62, 72),
    FmInstrument::new("Jingle Bell", [14, 10, 228, 228, 3], [7, 64, 85, 57, 1], 54, 73),
    FmInstrument::new("Belltree", [5, 5, 249, 50, 3], [4, 64, 214, 165, 0], 62, 70),
    FmInstrument::new("Castanets", [2, 63, 0, 243, 3], [21, 0, 247, 245, 0], 56, 68),
    FmInstrument::new("Mute Surdo", [1, 79, 250, 141, 0], [2, 0, 248, 181, 0], 55, 48),
    FmInstrument::new("Open Surdo", [0, 0, 246, 12, 0], [0, 0, 246, 6, 0], 52, 53),
];
